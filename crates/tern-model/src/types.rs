use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single block of assistant or user content.
///
/// The `partialJson` and `index` fields on tool calls exist only while a
/// stream is in flight: `index` is the provider-native block index used to
/// route deltas, `partialJson` is the raw argument buffer.  Both are cleared
/// when the block closes and must never appear in persisted history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Thinking {
        thinking: String,
        /// Opaque provider signature for reasoning provenance.  Round-trip
        /// preserved; never inspected.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        /// Base64-encoded image bytes.
        data: String,
        mime_type: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        id: String,
        name: String,
        /// Parsed argument object.  Best-effort while streaming, strict at
        /// block close.
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_json: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thinking(thinking: impl Into<String>, signature: Option<String>) -> Self {
        Self::Thinking {
            thinking: thinking.into(),
            signature,
        }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
            partial_json: None,
            index: None,
        }
    }
}

/// A block inside a tool result: text or image only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolResultBlock {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        data: String,
        mime_type: String,
    },
}

impl ToolResultBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

/// Token usage for one assistant message, overwritten (not summed) on every
/// provider usage event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    /// Always `input + output + cache_read + cache_write`.
    pub total_tokens: u64,
    pub cost: UsageCost,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageCost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub total: f64,
}

impl Usage {
    /// Recompute the token total after an overwrite.
    pub fn recompute_total(&mut self) {
        self.total_tokens = self.input + self.output + self.cache_read + self.cache_write;
    }
}

/// User message content: a plain string or a block list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl UserContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Blocks(blocks) if blocks.len() == 1 => match &blocks[0] {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }
}

/// A file attached to a user message.  Documents without `extracted_text`
/// are transformed by the host's attachment transformer before submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    /// Base64-encoded raw bytes.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub content: UserContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    /// Millisecond epoch timestamp.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    /// Wire protocol that produced this message (e.g. "anthropic-messages").
    pub api: String,
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

impl AssistantMessage {
    /// Empty assistant header emitted at stream start.
    pub fn empty(api: impl Into<String>, provider: impl Into<String>, model: impl Into<String>, timestamp: i64) -> Self {
        Self {
            content: Vec::new(),
            api: api.into(),
            provider: provider.into(),
            model: model.into(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            timestamp,
        }
    }

    /// All tool-call ids in this message, in content order.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text content (for display and tests).
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<ToolResultBlock>,
    pub is_error: bool,
    pub timestamp: i64,
}

/// A single message in the conversation, tagged by role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
    #[serde(rename_all = "camelCase")]
    BashExecution {
        command: String,
        output: String,
        exit_code: i32,
        timestamp: i64,
    },
}

impl Message {
    pub fn user(text: impl Into<String>, timestamp: i64) -> Self {
        Self::User(UserMessage {
            content: UserContent::Text(text.into()),
            attachments: None,
            timestamp,
        })
    }

    pub fn user_with_blocks(blocks: Vec<ContentBlock>, timestamp: i64) -> Self {
        Self::User(UserMessage {
            content: UserContent::Blocks(blocks),
            attachments: None,
            timestamp,
        })
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: Vec<ToolResultBlock>,
        is_error: bool,
        timestamp: i64,
    ) -> Self {
        Self::ToolResult(ToolResultMessage {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content,
            is_error,
            timestamp,
        })
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::User(m) => m.timestamp,
            Self::Assistant(m) => m.timestamp,
            Self::ToolResult(m) => m.timestamp,
            Self::BashExecution { timestamp, .. } => *timestamp,
        }
    }
}

// ─── Tools & request envelope ─────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

/// How the model is allowed to use tools on this request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool(String),
}

/// One named section of the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemPart {
    pub name: String,
    pub text: String,
}

/// The system prompt as ordered parts plus their compiled form.
///
/// Compilation is plain concatenation with no separator: parts own their
/// trailing whitespace so the compiled string preserves exact formatting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemPrompt {
    pub parts: Vec<SystemPart>,
    pub compiled: String,
}

impl SystemPrompt {
    pub fn new(parts: Vec<SystemPart>) -> Self {
        let compiled = compile_system_parts(&parts);
        Self { parts, compiled }
    }

    /// Recompile after the parts list changed.
    pub fn recompile(&mut self) {
        self.compiled = compile_system_parts(&self.parts);
    }
}

pub fn compile_system_parts(parts: &[SystemPart]) -> String {
    parts.iter().map(|p| p.text.as_str()).collect()
}

/// Message history split at the prompt-cache boundary.  Everything in
/// `cached` may be served from the provider's prompt cache; edits to it
/// invalidate the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextMessages {
    pub cached: Vec<Message>,
    pub uncached: Vec<Message>,
}

impl ContextMessages {
    pub fn all(&self) -> impl Iterator<Item = &Message> {
        self.cached.iter().chain(self.uncached.iter())
    }

    pub fn len(&self) -> usize {
        self.cached.len() + self.uncached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cached.is_empty() && self.uncached.is_empty()
    }
}

/// Sampling and reasoning options carried in the envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<tern_config::ThinkingLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Request metadata that never reaches the wire body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextMeta {
    pub model: String,
    /// Context window limit for the model.
    pub limit: u64,
    pub turn_index: u64,
    pub request_index: u64,
    /// Last known context token estimate, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

/// The full request envelope sent to a provider adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Context {
    pub system: SystemPrompt,
    pub tools: Vec<ToolDef>,
    pub messages: ContextMessages,
    pub options: RequestOptions,
    pub meta: ContextMeta,
}

// ─── Normalized adapter events ────────────────────────────────────────────────

/// Normalized streaming events emitted by every provider adapter.
///
/// Each event carries the evolving partial assistant message so observers
/// can render without tracking deltas themselves.  `index` is the position
/// of the affected block in `message.content`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantMessageEvent {
    Start {
        message: AssistantMessage,
    },
    TextStart {
        index: usize,
        message: AssistantMessage,
    },
    TextDelta {
        index: usize,
        delta: String,
        message: AssistantMessage,
    },
    TextEnd {
        index: usize,
        message: AssistantMessage,
    },
    ThinkingStart {
        index: usize,
        message: AssistantMessage,
    },
    ThinkingDelta {
        index: usize,
        delta: String,
        message: AssistantMessage,
    },
    ThinkingEnd {
        index: usize,
        message: AssistantMessage,
    },
    ToolCallStart {
        index: usize,
        message: AssistantMessage,
    },
    ToolCallDelta {
        index: usize,
        delta: String,
        message: AssistantMessage,
    },
    ToolCallEnd {
        index: usize,
        message: AssistantMessage,
    },
    Done {
        reason: StopReason,
        message: AssistantMessage,
    },
    Error {
        reason: StopReason,
        message: AssistantMessage,
    },
}

impl AssistantMessageEvent {
    /// The partial assistant message snapshot carried by this event.
    pub fn message(&self) -> &AssistantMessage {
        match self {
            Self::Start { message }
            | Self::TextStart { message, .. }
            | Self::TextDelta { message, .. }
            | Self::TextEnd { message, .. }
            | Self::ThinkingStart { message, .. }
            | Self::ThinkingDelta { message, .. }
            | Self::ThinkingEnd { message, .. }
            | Self::ToolCallStart { message, .. }
            | Self::ToolCallDelta { message, .. }
            | Self::ToolCallEnd { message, .. }
            | Self::Done { message, .. }
            | Self::Error { message, .. } => message,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
