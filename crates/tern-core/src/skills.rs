// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Skill set diffing for system-prompt hot-swap.
//!
//! Discovery is the host's job; the core receives the already-discovered
//! set, diffs it against the active one, and rewrites the skills section of
//! the system prompt.  Identity is the skill name; description and file
//! path are content — changing either counts as an update.

use serde::{Deserialize, Serialize};
use tern_model::SystemPart;

/// Name of the system-prompt part that carries the skill listing.
pub const SKILLS_PART: &str = "skills";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub file_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillDiff {
    pub added: Vec<Skill>,
    pub removed: Vec<Skill>,
    pub updated: Vec<Skill>,
}

impl SkillDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Diff two skill sets by name, comparing description and file path for
/// updates.  Output order follows `after` for added/updated and `before`
/// for removed.
pub fn diff_skills(before: &[Skill], after: &[Skill]) -> SkillDiff {
    let mut diff = SkillDiff::default();
    for skill in after {
        match before.iter().find(|b| b.name == skill.name) {
            None => diff.added.push(skill.clone()),
            Some(old) => {
                if old.description != skill.description || old.file_path != skill.file_path {
                    diff.updated.push(skill.clone());
                }
            }
        }
    }
    for skill in before {
        if !after.iter().any(|a| a.name == skill.name) {
            diff.removed.push(skill.clone());
        }
    }
    diff
}

/// Render the skill listing as a system-prompt part.
pub fn skills_system_part(skills: &[Skill]) -> SystemPart {
    let mut text = String::new();
    if !skills.is_empty() {
        text.push_str("\n\nAvailable skills:\n");
        for skill in skills {
            text.push_str(&format!("- {}: {}\n", skill.name, skill.description));
        }
    }
    SystemPart {
        name: SKILLS_PART.to_string(),
        text,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
