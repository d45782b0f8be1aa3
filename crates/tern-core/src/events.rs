// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tern_model::{AssistantMessageEvent, Message, ToolResultBlock};

use crate::skills::SkillDiff;

/// Events emitted by the agent during and between turns.
/// Observers subscribe with [`crate::agent::Agent::on`] and are invoked
/// synchronously, in subscription order, as each event fires.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A new turn begins (one queued user message enters processing).
    TurnStart,
    /// One normalized adapter event, forwarded with its partial message.
    MessageUpdate { event: AssistantMessageEvent },
    /// A message reached its final form and was appended to the session.
    MessageEnd { message: Message },
    /// Streamed partial output from a running tool.  Observer-only: never
    /// appended to the session, never sent to the provider.
    ToolResultPartial {
        tool_call_id: String,
        tool_name: String,
        content: Vec<ToolResultBlock>,
    },
    /// The turn finished; carries the final assistant message (errored or
    /// aborted turns included).
    TurnEnd { message: Option<Message> },
    /// The queue is drained and the agent is idle again.
    AgentEnd,
    /// Queue length / streaming flag / error changed.
    StateUpdate {
        is_streaming: bool,
        queued: usize,
        error: Option<String>,
    },
    /// The skill set was hot-swapped.
    SkillsChanged { diff: SkillDiff },
    /// A recoverable error outside the normal stream error path.
    Error { message: String },
}
