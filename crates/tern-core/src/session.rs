// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only session tree: a DAG of conversation entries with branching,
//! labels, compactions, and atomic sub-range replacement.
//!
//! Entries are never mutated in place.  The two exceptions the design
//! allows: a label entry supersedes earlier labels on the same target
//! (resolved at read time, latest wins), and the session-info name is a
//! singleton scalar.  Compaction entries may never be deleted — they are
//! the provenance trail for summarized history.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use tern_model::Message;

use crate::envelope::{default_compaction_summary, CompactionFormatter};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    pub id: String,
    /// RFC3339 creation time.
    pub timestamp: String,
    pub cwd: String,
    /// Fingerprint of the system prompt in effect at creation.
    pub system_prompt: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntry {
    /// Session header; the first line of a persisted session.
    Session(SessionHeader),
    #[serde(rename_all = "camelCase")]
    Message {
        id: String,
        parent_id: Option<String>,
        message: Message,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    Compaction {
        id: String,
        parent_id: Option<String>,
        summary: String,
        first_kept_message_index: usize,
        tokens_before: u64,
        timestamp: i64,
    },
    /// Label metadata: a named pointer to `target_id`.  Never part of the
    /// linearized conversation; `label: None` clears an earlier label.
    #[serde(rename_all = "camelCase")]
    Label {
        id: String,
        parent_id: Option<String>,
        target_id: String,
        label: Option<String>,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    CustomMessage {
        id: String,
        parent_id: Option<String>,
        custom_type: String,
        content: Value,
        display: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        timestamp: i64,
    },
    /// Singleton scalar metadata, overwritten in place.
    #[serde(rename_all = "camelCase")]
    SessionInfo { name: Option<String> },
}

impl SessionEntry {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Message { id, .. }
            | Self::Compaction { id, .. }
            | Self::Label { id, .. }
            | Self::CustomMessage { id, .. } => Some(id),
            Self::Session(_) | Self::SessionInfo { .. } => None,
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        match self {
            Self::Message { parent_id, .. }
            | Self::Compaction { parent_id, .. }
            | Self::Label { parent_id, .. }
            | Self::CustomMessage { parent_id, .. } => parent_id.as_deref(),
            Self::Session(_) | Self::SessionInfo { .. } => None,
        }
    }

    fn parent_id_mut(&mut self) -> Option<&mut Option<String>> {
        match self {
            Self::Message { parent_id, .. }
            | Self::Compaction { parent_id, .. }
            | Self::Label { parent_id, .. }
            | Self::CustomMessage { parent_id, .. } => Some(parent_id),
            Self::Session(_) | Self::SessionInfo { .. } => None,
        }
    }

    pub fn is_label(&self) -> bool {
        matches!(self, Self::Label { .. })
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TreeError {
    #[error("entry {0:?} does not exist")]
    UnknownEntry(String),
    #[error("deleteIds must not be empty")]
    EmptyDelete,
    #[error("compaction entry {0:?} cannot be deleted")]
    CompactionDelete(String),
    #[error("tree has multiple roots: {0:?} and {1:?}")]
    MultipleRoots(String, String),
    #[error("entry {id:?} references missing parent {parent:?}")]
    DanglingParent { id: String, parent: String },
    #[error("leaf {0:?} does not reference an existing entry")]
    MissingLeaf(String),
    #[error("restored entry stream has no header line")]
    MissingHeader,
}

/// Translate an opted-in custom entry into a context message.
pub type CustomTranslator = fn(&str, &Value, i64) -> Option<Message>;

#[derive(Debug)]
pub struct SessionTree {
    header: SessionHeader,
    /// DAG entries in append order.  The header and session-info lines are
    /// kept out of this list; `entries()` weaves them back in.
    entries: Vec<SessionEntry>,
    by_id: HashMap<String, usize>,
    leaf_id: Option<String>,
    name: Option<String>,
    next_seq: u64,
    /// custom_type → translator used by [`Self::build_session_context`].
    translators: HashMap<String, CustomTranslator>,
}

impl SessionTree {
    pub fn new(cwd: &str, system_prompt_fingerprint: &str, model: &str) -> Self {
        Self {
            header: SessionHeader {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                cwd: cwd.to_string(),
                system_prompt: system_prompt_fingerprint.to_string(),
                model: model.to_string(),
            },
            entries: Vec::new(),
            by_id: HashMap::new(),
            leaf_id: None,
            name: None,
            next_seq: 1,
            translators: HashMap::new(),
        }
    }

    /// Rebuild a tree from a persisted entry stream, revalidating every
    /// invariant.  Malformed leading state (no header) is an error; the
    /// caller is responsible for skipping unparseable lines before this.
    pub fn from_entries(entries: Vec<SessionEntry>) -> Result<Self, TreeError> {
        let mut header = None;
        let mut name = None;
        let mut dag: Vec<SessionEntry> = Vec::new();
        for entry in entries {
            match entry {
                SessionEntry::Session(h) => header = Some(h),
                SessionEntry::SessionInfo { name: n } => name = n,
                other => dag.push(other),
            }
        }
        let header = header.ok_or(TreeError::MissingHeader)?;

        let mut by_id = HashMap::new();
        for (i, entry) in dag.iter().enumerate() {
            if let Some(id) = entry.id() {
                by_id.insert(id.to_string(), i);
            }
        }
        let leaf_id = dag
            .iter()
            .rev()
            .find(|e| !e.is_label())
            .and_then(|e| e.id())
            .map(String::from);
        // Resume the id sequence past the highest persisted id so replays
        // after a replace_entries never collide.
        let next_seq = dag
            .iter()
            .filter_map(|e| e.id().and_then(|id| id.parse::<u64>().ok()))
            .max()
            .unwrap_or(0)
            + 1;

        let tree = Self {
            header,
            entries: dag,
            by_id,
            leaf_id,
            name,
            next_seq,
            translators: HashMap::new(),
        };
        tree.validate()?;
        Ok(tree)
    }

    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    pub fn leaf_id(&self) -> Option<&str> {
        self.leaf_id.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Overwrite the session-info name (singleton scalar).
    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    /// Register a translator that materializes `custom_type` entries into
    /// context messages.
    pub fn register_custom_translator(&mut self, custom_type: &str, translator: CustomTranslator) {
        self.translators.insert(custom_type.to_string(), translator);
    }

    /// Full persisted form: header first, then session info when set, then
    /// the DAG entries in append order.
    pub fn entries(&self) -> Vec<SessionEntry> {
        let mut out = Vec::with_capacity(self.entries.len() + 2);
        out.push(SessionEntry::Session(self.header.clone()));
        if self.name.is_some() {
            out.push(SessionEntry::SessionInfo {
                name: self.name.clone(),
            });
        }
        out.extend(self.entries.iter().cloned());
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SessionEntry> {
        self.by_id.get(id).map(|&i| &self.entries[i])
    }

    fn next_id(&mut self) -> String {
        let id = format!("{:04}", self.next_seq);
        self.next_seq += 1;
        id
    }

    fn push(&mut self, entry: SessionEntry) {
        if let Some(id) = entry.id() {
            self.by_id.insert(id.to_string(), self.entries.len());
        }
        self.entries.push(entry);
        debug_assert!(self.validate().is_ok());
    }

    /// Append a message as a child of the current leaf and advance the leaf.
    pub fn append_message(&mut self, message: Message) -> String {
        let id = self.next_id();
        let timestamp = message.timestamp();
        let entry = SessionEntry::Message {
            id: id.clone(),
            parent_id: self.leaf_id.clone(),
            message,
            timestamp,
        };
        self.push(entry);
        self.leaf_id = Some(id.clone());
        id
    }

    /// Point the leaf at an existing entry without mutating the tree.
    /// Subsequent appends create a sibling branch.
    pub fn branch(&mut self, entry_id: &str) -> Result<(), TreeError> {
        if !self.by_id.contains_key(entry_id) {
            return Err(TreeError::UnknownEntry(entry_id.to_string()));
        }
        self.leaf_id = Some(entry_id.to_string());
        Ok(())
    }

    /// Record a label change for `target_id`.  Labels resolve at read time:
    /// the latest label entry for a target wins, `None` clears.
    pub fn append_label_change(
        &mut self,
        target_id: &str,
        label: Option<String>,
    ) -> Result<String, TreeError> {
        if !self.by_id.contains_key(target_id) {
            return Err(TreeError::UnknownEntry(target_id.to_string()));
        }
        let id = self.next_id();
        let entry = SessionEntry::Label {
            id: id.clone(),
            parent_id: self.leaf_id.clone(),
            target_id: target_id.to_string(),
            label,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.push(entry);
        // The leaf does not advance: labels are metadata, not conversation.
        Ok(id)
    }

    /// Resolve the current label of an entry, scanning label entries in
    /// append order so the latest change wins.
    pub fn resolve_label(&self, target_id: &str) -> Option<String> {
        let mut current = None;
        for entry in &self.entries {
            if let SessionEntry::Label {
                target_id: t,
                label,
                ..
            } = entry
            {
                if t == target_id {
                    current = label.clone();
                }
            }
        }
        current
    }

    /// Append a compaction entry and advance the leaf to it.
    pub fn append_compaction(
        &mut self,
        summary: &str,
        first_kept_message_index: usize,
        tokens_before: u64,
    ) -> String {
        let id = self.next_id();
        let entry = SessionEntry::Compaction {
            id: id.clone(),
            parent_id: self.leaf_id.clone(),
            summary: summary.to_string(),
            first_kept_message_index,
            tokens_before,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.push(entry);
        self.leaf_id = Some(id.clone());
        id
    }

    /// Append an app-level custom entry as a child of the current leaf and
    /// advance the leaf.
    pub fn append_custom(
        &mut self,
        custom_type: &str,
        content: Value,
        display: bool,
        details: Option<Value>,
    ) -> String {
        let id = self.next_id();
        let entry = SessionEntry::CustomMessage {
            id: id.clone(),
            parent_id: self.leaf_id.clone(),
            custom_type: custom_type.to_string(),
            content,
            display,
            details,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.push(entry);
        self.leaf_id = Some(id.clone());
        id
    }

    /// Atomically replace a set of entries with one custom entry, rewriting
    /// the parent pointers of surviving children so every chain through the
    /// deleted range now passes through the replacement.
    pub fn replace_entries(
        &mut self,
        delete_ids: &[String],
        custom_type: &str,
        content: Value,
        display: bool,
        details: Option<Value>,
    ) -> Result<String, TreeError> {
        if delete_ids.is_empty() {
            return Err(TreeError::EmptyDelete);
        }
        let delete: HashSet<&str> = delete_ids.iter().map(String::as_str).collect();
        for id in delete_ids {
            match self.get(id) {
                None => return Err(TreeError::UnknownEntry(id.clone())),
                Some(SessionEntry::Compaction { .. }) => {
                    return Err(TreeError::CompactionDelete(id.clone()))
                }
                Some(_) => {}
            }
        }

        // Entries are append-ordered, so the first hit is the earliest
        // deleted entry in topological order; the replacement takes over its
        // parent slot.
        let first_deleted_parent = self
            .entries
            .iter()
            .find(|e| e.id().is_some_and(|id| delete.contains(id)))
            .and_then(|e| e.parent_id())
            .map(String::from);

        let new_id = self.next_id();
        let replacement = SessionEntry::CustomMessage {
            id: new_id.clone(),
            parent_id: first_deleted_parent,
            custom_type: custom_type.to_string(),
            content,
            display,
            details,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        // Rechain surviving children of deleted entries onto the new node.
        for entry in self.entries.iter_mut() {
            if entry.id().is_some_and(|id| delete.contains(id)) {
                continue;
            }
            if let Some(parent) = entry.parent_id_mut() {
                if parent.as_deref().is_some_and(|p| delete.contains(p)) {
                    *parent = Some(new_id.clone());
                }
            }
        }

        // Physically drop the deleted entries and rebuild the index.
        self.entries
            .retain(|e| !e.id().is_some_and(|id| delete.contains(id)));
        self.entries.push(replacement);
        self.by_id.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(id) = entry.id() {
                self.by_id.insert(id.to_string(), i);
            }
        }

        if self
            .leaf_id
            .as_deref()
            .is_some_and(|leaf| delete.contains(leaf))
        {
            self.leaf_id = Some(new_id.clone());
        }

        self.validate()?;
        Ok(new_id)
    }

    /// Rebuild the conversation from scratch (admin operation, e.g.
    /// edit-and-resubmit).  The header and session name are preserved;
    /// every existing entry is dropped.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.entries.clear();
        self.by_id.clear();
        self.leaf_id = None;
        for message in messages {
            self.append_message(message);
        }
    }

    /// Root-to-leaf linearization of the current branch.  Label entries are
    /// never on the parent chain, so they do not appear.
    pub fn get_branch(&self) -> Vec<&SessionEntry> {
        let mut chain = Vec::new();
        let mut cursor = self.leaf_id.as_deref();
        while let Some(id) = cursor {
            let Some(entry) = self.get(id) else { break };
            chain.push(entry);
            cursor = entry.parent_id();
        }
        chain.reverse();
        chain
    }

    /// Produce the message list for the request envelope from the current
    /// branch.  Compactions materialize as their summary message; custom
    /// entries only appear when a translator for their type is registered.
    pub fn build_session_context(&self) -> Vec<Message> {
        self.build_session_context_with(&default_compaction_summary)
    }

    pub fn build_session_context_with(
        &self,
        format_summary: &CompactionFormatter,
    ) -> Vec<Message> {
        let mut out = Vec::new();
        for entry in self.get_branch() {
            match entry {
                SessionEntry::Message { message, .. } => out.push(message.clone()),
                SessionEntry::Compaction {
                    summary, timestamp, ..
                } => out.push(format_summary(summary, *timestamp)),
                SessionEntry::CustomMessage {
                    custom_type,
                    content,
                    timestamp,
                    ..
                } => {
                    if let Some(translate) = self.translators.get(custom_type) {
                        if let Some(message) = translate(custom_type, content, *timestamp) {
                            out.push(message);
                        }
                    }
                }
                SessionEntry::Label { .. }
                | SessionEntry::Session(_)
                | SessionEntry::SessionInfo { .. } => {}
            }
        }
        out
    }

    /// Check every structural invariant: at most one root, resolvable
    /// parents, and a live leaf.
    pub fn validate(&self) -> Result<(), TreeError> {
        let mut root: Option<&str> = None;
        for entry in &self.entries {
            let Some(id) = entry.id() else { continue };
            match entry.parent_id() {
                None => {
                    // Labels on an empty tree cannot exist (targets must),
                    // so every parentless entry competes for the root slot.
                    if let Some(existing) = root {
                        if !entry.is_label() {
                            return Err(TreeError::MultipleRoots(
                                existing.to_string(),
                                id.to_string(),
                            ));
                        }
                    } else if !entry.is_label() {
                        root = Some(id);
                    }
                }
                Some(parent) => {
                    if !self.by_id.contains_key(parent) {
                        return Err(TreeError::DanglingParent {
                            id: id.to_string(),
                            parent: parent.to_string(),
                        });
                    }
                }
            }
        }
        if let Some(leaf) = &self.leaf_id {
            if !self.by_id.contains_key(leaf) {
                return Err(TreeError::MissingLeaf(leaf.clone()));
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
