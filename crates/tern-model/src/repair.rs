// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Transcript repair: the pre-submission pass every driver applies before
//! serializing history to a provider.
//!
//! Providers reject histories where a `tool_use` block has no matching
//! result, where a result references an unknown call id, or (for strict
//! variants) where two same-role messages are adjacent.  Errored and aborted
//! assistant turns are the usual source of all three, so the repair drops
//! them and everything that referenced them.  The pass is deterministic,
//! order-preserving, and idempotent.

use std::collections::HashSet;

use crate::types::{ContentBlock, Message, StopReason, UserContent};

/// Drop errored/aborted assistant messages, the tool results that answer
/// them, and any orphaned tool results left over.
pub fn repair_transcript(messages: &[Message]) -> Vec<Message> {
    // Ids belonging to assistant turns that will be dropped.
    let mut dropped_ids: HashSet<String> = HashSet::new();
    for m in messages {
        if let Message::Assistant(a) = m {
            if matches!(a.stop_reason, StopReason::Error | StopReason::Aborted) {
                for id in a.tool_call_ids() {
                    dropped_ids.insert(id.to_string());
                }
            }
        }
    }

    let mut out = Vec::with_capacity(messages.len());
    // Tool-call ids from surviving assistants that still await their result.
    let mut open_ids: HashSet<String> = HashSet::new();
    for m in messages {
        match m {
            Message::Assistant(a) => {
                if matches!(a.stop_reason, StopReason::Error | StopReason::Aborted) {
                    continue;
                }
                for id in a.tool_call_ids() {
                    open_ids.insert(id.to_string());
                }
                out.push(m.clone());
            }
            Message::ToolResult(r) => {
                if dropped_ids.contains(&r.tool_call_id) {
                    continue;
                }
                // Orphan (no surviving call) or duplicate (call already
                // answered): drop either way.
                if !open_ids.remove(&r.tool_call_id) {
                    continue;
                }
                out.push(m.clone());
            }
            other => out.push(other.clone()),
        }
    }
    out
}

/// Merge runs of consecutive user messages into one.
///
/// Anthropic's strict-alternation variants reject back-to-back user turns,
/// which arise naturally after repair drops an assistant turn in between.
/// The merged message keeps the first message's timestamp and concatenates
/// content as blocks.
pub fn merge_consecutive_user(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for m in messages {
        match (&m, out.last_mut()) {
            (Message::User(next), Some(Message::User(prev))) => {
                let mut blocks = content_blocks(&prev.content);
                blocks.extend(content_blocks(&next.content));
                prev.content = UserContent::Blocks(blocks);
            }
            _ => out.push(m),
        }
    }
    out
}

fn content_blocks(content: &UserContent) -> Vec<ContentBlock> {
    match content {
        UserContent::Text(t) => vec![ContentBlock::text(t.clone())],
        UserContent::Blocks(blocks) => blocks.clone(),
    }
}

/// Demote thinking blocks without a signature to plain text.
///
/// The signature is what providers use to verify reasoning provenance on
/// resubmission; an unsigned thinking block would be rejected, so its text
/// is preserved as a normal text block instead.
pub fn demote_unsigned_thinking(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .map(|m| match m {
            Message::Assistant(mut a) => {
                for block in a.content.iter_mut() {
                    if let ContentBlock::Thinking {
                        thinking,
                        signature: None,
                    } = block
                    {
                        *block = ContentBlock::text(std::mem::take(thinking));
                    }
                }
                Message::Assistant(a)
            }
            other => other,
        })
        .collect()
}

/// Render app-level bash-execution entries as plain user text so providers
/// see them as ordinary context.
pub fn render_bash_executions(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .map(|m| match m {
            Message::BashExecution {
                command,
                output,
                exit_code,
                timestamp,
            } => {
                let text = format!("$ {command}\n{output}\n(exit {exit_code})");
                Message::user(text, timestamp)
            }
            other => other,
        })
        .collect()
}

/// The full pre-submission pipeline used by every driver's `build_params`.
pub fn prepare_for_submission(messages: &[Message], supports_images: bool) -> Vec<Message> {
    let repaired = repair_transcript(messages);
    let repaired = demote_unsigned_thinking(repaired);
    let repaired = render_bash_executions(repaired);
    let repaired = crate::sanitize::strip_images_for_text_model(repaired, supports_images);
    merge_consecutive_user(repaired)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
