// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Declarative context patches with prompt-cache invalidation tracking.
//!
//! A patch is an ordered list of ops applied to a request envelope.  Ops on
//! the cached prefix (system prompt, tools, cached messages, options) must
//! state why the cache is being invalidated; appends to the uncached tail
//! are free.  Applying a patch yields the new envelope plus the invalidation
//! flag and the deduplicated reasons, which callers surface in logs and
//! metrics to keep cache-miss regressions diagnosable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tern_model::{
    ContentBlock, Context, Message, RequestOptions, SystemPart, ToolDef, UserContent, UserMessage,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ContextPatchOp {
    /// Upsert one named system part: replace in place when the name exists,
    /// append otherwise.
    #[serde(rename_all = "camelCase")]
    SystemPartSet {
        part: SystemPart,
        invalidate_cache_reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SystemPartRemove {
        name: String,
        invalidate_cache_reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SystemPartsReplace {
        parts: Vec<SystemPart>,
        invalidate_cache_reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolsReplace {
        tools: Vec<ToolDef>,
        invalidate_cache_reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolsRemove {
        names: Vec<String>,
        invalidate_cache_reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MessagesCachedReplace {
        messages: Vec<Message>,
        invalidate_cache_reason: Option<String>,
    },
    /// The only op that never invalidates the cache.
    #[serde(rename_all = "camelCase")]
    MessagesUncachedAppend { messages: Vec<Message> },
    /// Merge options: provided values override, absent values are preserved.
    #[serde(rename_all = "camelCase")]
    OptionsSet {
        options: RequestOptions,
        invalidate_cache_reason: Option<String>,
    },
    /// Fold the cached prefix before `first_kept_message_index` into a
    /// summary message.  The timestamp makes replay deterministic.
    #[serde(rename_all = "camelCase")]
    CompactionApply {
        summary: String,
        first_kept_message_index: usize,
        timestamp: i64,
        invalidate_cache_reason: Option<String>,
    },
}

impl ContextPatchOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SystemPartSet { .. } => "system_part_set",
            Self::SystemPartRemove { .. } => "system_part_remove",
            Self::SystemPartsReplace { .. } => "system_parts_replace",
            Self::ToolsReplace { .. } => "tools_replace",
            Self::ToolsRemove { .. } => "tools_remove",
            Self::MessagesCachedReplace { .. } => "messages_cached_replace",
            Self::MessagesUncachedAppend { .. } => "messages_uncached_append",
            Self::OptionsSet { .. } => "options_set",
            Self::CompactionApply { .. } => "compaction_apply",
        }
    }

    /// The stated invalidation reason for cached-scope ops; `None` for the
    /// uncached append.
    fn reason(&self) -> Option<&Option<String>> {
        match self {
            Self::SystemPartSet {
                invalidate_cache_reason,
                ..
            }
            | Self::SystemPartRemove {
                invalidate_cache_reason,
                ..
            }
            | Self::SystemPartsReplace {
                invalidate_cache_reason,
                ..
            }
            | Self::ToolsReplace {
                invalidate_cache_reason,
                ..
            }
            | Self::ToolsRemove {
                invalidate_cache_reason,
                ..
            }
            | Self::MessagesCachedReplace {
                invalidate_cache_reason,
                ..
            }
            | Self::OptionsSet {
                invalidate_cache_reason,
                ..
            }
            | Self::CompactionApply {
                invalidate_cache_reason,
                ..
            } => Some(invalidate_cache_reason),
            Self::MessagesUncachedAppend { .. } => None,
        }
    }

    /// Validate the invalidation-reason requirement without applying.
    pub fn validate(&self) -> Result<(), PatchError> {
        if let Some(reason) = self.reason() {
            match reason {
                Some(r) if !r.trim().is_empty() => Ok(()),
                _ => Err(PatchError::MissingReason { op: self.name() }),
            }
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PatchError {
    #[error("cached op `{op}` requires a non-empty invalidateCacheReason")]
    MissingReason { op: &'static str },
}

#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub context: Context,
    pub cache_invalidated: bool,
    /// Unique trimmed reasons, in order of first occurrence.
    pub invalidate_cache_reasons: Vec<String>,
}

/// Turn a compaction summary string into the message that replaces the
/// folded prefix.
pub type CompactionFormatter = dyn Fn(&str, i64) -> Message + Send + Sync;

/// Default formatter: a user message with one text block carrying the
/// summary verbatim.
pub fn default_compaction_summary(summary: &str, timestamp: i64) -> Message {
    Message::User(UserMessage {
        content: UserContent::Blocks(vec![ContentBlock::text(summary)]),
        attachments: None,
        timestamp,
    })
}

/// Apply an ordered list of ops with the default compaction formatter.
pub fn apply_patch(context: &Context, ops: &[ContextPatchOp]) -> Result<PatchOutcome, PatchError> {
    apply_patch_with(context, ops, &default_compaction_summary)
}

/// Apply an ordered list of ops.  All ops are validated before any is
/// applied, so a failing patch leaves no partial result.
pub fn apply_patch_with(
    context: &Context,
    ops: &[ContextPatchOp],
    format_summary: &CompactionFormatter,
) -> Result<PatchOutcome, PatchError> {
    for op in ops {
        op.validate()?;
    }

    let mut context = context.clone();
    let mut cache_invalidated = false;
    let mut reasons: Vec<String> = Vec::new();
    let mut record = |reason: &Option<String>, invalidated: &mut bool| {
        *invalidated = true;
        if let Some(r) = reason {
            let trimmed = r.trim().to_string();
            if !reasons.contains(&trimmed) {
                reasons.push(trimmed);
            }
        }
    };

    for op in ops {
        match op {
            ContextPatchOp::SystemPartSet {
                part,
                invalidate_cache_reason,
            } => {
                record(invalidate_cache_reason, &mut cache_invalidated);
                match context
                    .system
                    .parts
                    .iter_mut()
                    .find(|p| p.name == part.name)
                {
                    Some(existing) => *existing = part.clone(),
                    None => context.system.parts.push(part.clone()),
                }
                context.system.recompile();
            }
            ContextPatchOp::SystemPartRemove {
                name,
                invalidate_cache_reason,
            } => {
                record(invalidate_cache_reason, &mut cache_invalidated);
                context.system.parts.retain(|p| &p.name != name);
                context.system.recompile();
            }
            ContextPatchOp::SystemPartsReplace {
                parts,
                invalidate_cache_reason,
            } => {
                record(invalidate_cache_reason, &mut cache_invalidated);
                context.system.parts = parts.clone();
                context.system.recompile();
            }
            ContextPatchOp::ToolsReplace {
                tools,
                invalidate_cache_reason,
            } => {
                record(invalidate_cache_reason, &mut cache_invalidated);
                context.tools = tools.clone();
            }
            ContextPatchOp::ToolsRemove {
                names,
                invalidate_cache_reason,
            } => {
                record(invalidate_cache_reason, &mut cache_invalidated);
                context.tools.retain(|t| !names.contains(&t.name));
            }
            ContextPatchOp::MessagesCachedReplace {
                messages,
                invalidate_cache_reason,
            } => {
                record(invalidate_cache_reason, &mut cache_invalidated);
                context.messages.cached = messages.clone();
            }
            ContextPatchOp::MessagesUncachedAppend { messages } => {
                context.messages.uncached.extend(messages.iter().cloned());
            }
            ContextPatchOp::OptionsSet {
                options,
                invalidate_cache_reason,
            } => {
                record(invalidate_cache_reason, &mut cache_invalidated);
                if let Some(r) = options.reasoning {
                    context.options.reasoning = Some(r);
                }
                if let Some(t) = options.temperature {
                    context.options.temperature = Some(t);
                }
                if let Some(m) = options.max_tokens {
                    context.options.max_tokens = Some(m);
                }
            }
            ContextPatchOp::CompactionApply {
                summary,
                first_kept_message_index,
                timestamp,
                invalidate_cache_reason,
            } => {
                record(invalidate_cache_reason, &mut cache_invalidated);
                let kept_from = (*first_kept_message_index).min(context.messages.cached.len());
                let kept: Vec<Message> = context.messages.cached.split_off(kept_from);
                context.messages.cached = Vec::with_capacity(kept.len() + 1);
                context
                    .messages
                    .cached
                    .push(format_summary(summary, *timestamp));
                context.messages.cached.extend(kept);
            }
        }
    }

    Ok(PatchOutcome {
        context,
        cache_invalidated,
        invalidate_cache_reasons: reasons,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
