// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Driver contract and the shared streaming assembler.
//!
//! A driver knows one wire protocol: how to serialize the request envelope,
//! how to open the upstream stream, and how to decode its native events into
//! [`WireEvent`]s.  The assembler is protocol-agnostic — it owns the growing
//! scratch assistant message, routes deltas by provider-native block index,
//! and emits the normalized [`AssistantMessageEvent`] taxonomy.

use std::pin::Pin;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog;
use crate::partial_json::parse_partial_json;
use crate::sanitize::scrub_lone_surrogates;
use crate::stream::{EventSink, EventStream, StreamError};
use crate::types::{
    AssistantMessage, AssistantMessageEvent, ContentBlock, Context, StopReason, ToolChoice,
};

pub type WireStream = Pin<Box<dyn Stream<Item = anyhow::Result<Value>> + Send>>;

/// Per-call options that never live in the envelope.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub tool_choice: Option<ToolChoice>,
    pub cancel: CancellationToken,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            tool_choice: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Protocol-normalized events decoded from a provider's native stream.
#[derive(Debug, Clone)]
pub enum WireEvent {
    BlockStart { index: u32, block: WireBlock },
    TextDelta { index: u32, text: String },
    ThinkingDelta { index: u32, text: String },
    SignatureDelta { index: u32, signature: String },
    ToolJsonDelta { index: u32, json: String },
    BlockStop { index: u32 },
    Usage(UsageUpdate),
    StopReason(String),
    /// Provider-reported semantic error; terminal for the turn.
    Failure(String),
    Done,
    Ignore,
}

#[derive(Debug, Clone)]
pub enum WireBlock {
    Text,
    Thinking,
    ToolCall { id: String, name: String },
}

/// A usage report.  Fields are overwritten, never summed; `None` leaves the
/// previous value in place (providers report input and output in different
/// frames).
#[derive(Debug, Clone, Default)]
pub struct UsageUpdate {
    pub input: Option<u64>,
    pub output: Option<u64>,
    pub cache_read: Option<u64>,
    pub cache_write: Option<u64>,
}

/// Default stop-reason mapping shared across protocols.  Drivers override
/// [`ProviderDriver::map_stop_reason`] for provider-specific names.
pub fn default_stop_reason(raw: &str) -> StopReason {
    match raw {
        "end_turn" | "stop" => StopReason::Stop,
        "max_tokens" | "length" => StopReason::Length,
        "tool_use" | "tool_calls" => StopReason::ToolUse,
        "refusal" => StopReason::Error,
        _ => StopReason::Stop,
    }
}

#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Wire-protocol identifier recorded on every assistant message.
    fn api(&self) -> &'static str;

    /// Provider identity (e.g. "anthropic" for both the native API and
    /// Bedrock).
    fn provider(&self) -> &'static str;

    /// Serialize the envelope to the provider's request body.  Applies
    /// transcript repair, sanitization, and tool-choice translation.
    fn build_params(
        &self,
        model: &str,
        context: &Context,
        options: &StreamOptions,
    ) -> anyhow::Result<Value>;

    /// Open the upstream stream and return its framed native events.
    async fn create_event_stream(
        &self,
        model: &str,
        context: &Context,
        options: &StreamOptions,
    ) -> anyhow::Result<WireStream>;

    /// Decode one native event into normalized wire events.
    fn decode_event(&self, raw: &Value) -> Vec<WireEvent>;

    fn map_stop_reason(&self, raw: &str) -> StopReason {
        default_stop_reason(raw)
    }
}

impl std::fmt::Debug for dyn ProviderDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDriver")
            .field("provider", &self.provider())
            .field("api", &self.api())
            .finish()
    }
}

/// Drive a provider stream to completion, emitting normalized events.
///
/// This is the only public entry point for streaming: it owns cancellation
/// checks, the scratch message, and the guarantee that all terminal
/// conditions surface as a final `Done`/`Error` event rather than a panic or
/// a hung consumer.
pub fn stream(
    driver: Arc<dyn ProviderDriver>,
    model: &str,
    context: Context,
    options: StreamOptions,
) -> EventStream<AssistantMessageEvent, AssistantMessage> {
    let (sink, out) = EventStream::channel();
    let model = model.to_string();
    tokio::spawn(async move {
        let header = AssistantMessage::empty(
            driver.api(),
            driver.provider(),
            model.clone(),
            chrono::Utc::now().timestamp_millis(),
        );
        let mut asm = Assembler::new(sink, header);

        // Pre-aborted caller: never open the stream.
        if options.cancel.is_cancelled() {
            asm.fail(StopReason::Aborted, "aborted before request");
            return;
        }
        asm.start();

        match drive(&*driver, &model, &context, &options, &mut asm).await {
            Ok(raw_stop) => {
                let reason = match raw_stop {
                    Some(raw) => driver.map_stop_reason(&raw),
                    // A stream that closed without a stop reason but with
                    // tool calls is a tool-use turn.
                    None if asm.has_tool_calls() => StopReason::ToolUse,
                    None => StopReason::Stop,
                };
                asm.finish(reason);
            }
            Err(e) => {
                if options.cancel.is_cancelled() {
                    asm.fail(StopReason::Aborted, &format!("aborted: {e}"));
                } else {
                    asm.fail(StopReason::Error, &e.to_string());
                }
            }
        }
    });
    out
}

async fn drive(
    driver: &dyn ProviderDriver,
    model: &str,
    context: &Context,
    options: &StreamOptions,
    asm: &mut Assembler,
) -> anyhow::Result<Option<String>> {
    let mut wire = driver.create_event_stream(model, context, options).await?;
    let mut raw_stop: Option<String> = None;
    loop {
        let item = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => bail!("cancel signal fired mid-stream"),
            item = wire.next() => item,
        };
        let Some(item) = item else {
            return Ok(raw_stop);
        };
        for event in driver.decode_event(&item?) {
            match event {
                WireEvent::StopReason(raw) => raw_stop = Some(raw),
                WireEvent::Done => return Ok(raw_stop),
                WireEvent::Failure(message) => bail!(message),
                other => asm.handle(other),
            }
        }
    }
}

// ─── Assembler ────────────────────────────────────────────────────────────────

/// Owns the scratch assistant message during one stream.
///
/// Blocks are routed by the provider-native index, which is mirrored onto
/// tool-call blocks while they are open and cleared the moment they close so
/// it never leaks into persisted history.
pub(crate) struct Assembler {
    sink: EventSink<AssistantMessageEvent, AssistantMessage>,
    message: AssistantMessage,
    /// provider-native index → position in `message.content`, for open blocks.
    open: Vec<(u32, usize)>,
}

enum ClosedKind {
    Text,
    Thinking,
    Tool,
}

impl Assembler {
    pub(crate) fn new(
        sink: EventSink<AssistantMessageEvent, AssistantMessage>,
        header: AssistantMessage,
    ) -> Self {
        Self {
            sink,
            message: header,
            open: Vec::new(),
        }
    }

    pub(crate) fn has_tool_calls(&self) -> bool {
        self.message
            .content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolCall { .. }))
    }

    pub(crate) fn start(&mut self) {
        self.sink.push(AssistantMessageEvent::Start {
            message: self.message.clone(),
        });
    }

    fn position_of(&self, index: u32) -> Option<usize> {
        self.open
            .iter()
            .find(|(idx, _)| *idx == index)
            .map(|(_, pos)| *pos)
    }

    fn open_block(&mut self, index: u32, block: WireBlock) -> usize {
        let pos = self.message.content.len();
        let content = match block {
            WireBlock::Text => ContentBlock::text(""),
            WireBlock::Thinking => ContentBlock::thinking("", None),
            WireBlock::ToolCall { id, name } => ContentBlock::ToolCall {
                id,
                name,
                arguments: Value::Object(Default::default()),
                partial_json: Some(String::new()),
                index: Some(index),
            },
        };
        self.message.content.push(content);
        self.open.push((index, pos));
        let message = self.message.clone();
        let event = match &self.message.content[pos] {
            ContentBlock::Text { .. } => AssistantMessageEvent::TextStart { index: pos, message },
            ContentBlock::Thinking { .. } => {
                AssistantMessageEvent::ThinkingStart { index: pos, message }
            }
            _ => AssistantMessageEvent::ToolCallStart { index: pos, message },
        };
        self.sink.push(event);
        pos
    }

    /// Ensure a block exists at `index`, auto-opening one for protocols that
    /// never send explicit starts.
    fn ensure_block(&mut self, index: u32, block: WireBlock) -> usize {
        match self.position_of(index) {
            Some(pos) => pos,
            None => self.open_block(index, block),
        }
    }

    pub(crate) fn handle(&mut self, event: WireEvent) {
        match event {
            WireEvent::BlockStart { index, block } => {
                self.open_block(index, block);
            }
            WireEvent::TextDelta { index, text } => {
                if text.is_empty() {
                    return;
                }
                let pos = self.ensure_block(index, WireBlock::Text);
                if let Some(ContentBlock::Text { text: buf }) = self.message.content.get_mut(pos) {
                    buf.push_str(&text);
                }
                self.sink.push(AssistantMessageEvent::TextDelta {
                    index: pos,
                    delta: text,
                    message: self.message.clone(),
                });
            }
            WireEvent::ThinkingDelta { index, text } => {
                if text.is_empty() {
                    return;
                }
                let pos = self.ensure_block(index, WireBlock::Thinking);
                if let Some(ContentBlock::Thinking { thinking, .. }) =
                    self.message.content.get_mut(pos)
                {
                    thinking.push_str(&text);
                }
                self.sink.push(AssistantMessageEvent::ThinkingDelta {
                    index: pos,
                    delta: text,
                    message: self.message.clone(),
                });
            }
            WireEvent::SignatureDelta { index, signature } => {
                if let Some(pos) = self.position_of(index) {
                    if let Some(ContentBlock::Thinking { signature: sig, .. }) =
                        self.message.content.get_mut(pos)
                    {
                        sig.get_or_insert_with(String::new).push_str(&signature);
                    }
                }
            }
            WireEvent::ToolJsonDelta { index, json } => {
                let Some(pos) = self.position_of(index) else {
                    debug!(index, "tool json delta for unknown block; dropped");
                    return;
                };
                if let Some(ContentBlock::ToolCall {
                    arguments,
                    partial_json,
                    ..
                }) = self.message.content.get_mut(pos)
                {
                    let buf = partial_json.get_or_insert_with(String::new);
                    buf.push_str(&json);
                    // Best-effort re-parse on every delta; keep the previous
                    // snapshot when the prefix is momentarily unparseable.
                    if let Some(v) = parse_partial_json(&scrub_lone_surrogates(buf)) {
                        *arguments = v;
                    }
                }
                self.sink.push(AssistantMessageEvent::ToolCallDelta {
                    index: pos,
                    delta: json,
                    message: self.message.clone(),
                });
            }
            WireEvent::BlockStop { index } => self.close_block(index),
            WireEvent::Usage(update) => self.apply_usage(update),
            // Terminal variants are routed by the drive loop.
            WireEvent::StopReason(_) | WireEvent::Done | WireEvent::Failure(_) => {}
            WireEvent::Ignore => {}
        }
    }

    fn close_block(&mut self, index: u32) {
        let Some(slot) = self.open.iter().position(|(idx, _)| *idx == index) else {
            return;
        };
        let (_, pos) = self.open.remove(slot);
        let closed = match self.message.content.get_mut(pos) {
            Some(ContentBlock::Text { .. }) => ClosedKind::Text,
            Some(ContentBlock::Thinking { .. }) => ClosedKind::Thinking,
            Some(ContentBlock::ToolCall {
                id,
                name,
                arguments,
                partial_json,
                index: scratch_index,
            }) => {
                // Strict parse is required at block close; the streaming
                // parser result is only a preview.
                let raw = partial_json.take().unwrap_or_default();
                *scratch_index = None;
                let scrubbed = scrub_lone_surrogates(&raw);
                match serde_json::from_str::<Value>(&scrubbed) {
                    Ok(v) => *arguments = v,
                    Err(parse_err) => match parse_partial_json(&scrubbed) {
                        Some(v) => {
                            warn!(
                                tool_name = %name,
                                tool_call_id = %id,
                                error = %parse_err,
                                "tool arguments required prefix repair at block close"
                            );
                            *arguments = v;
                        }
                        None => {
                            warn!(
                                tool_name = %name,
                                tool_call_id = %id,
                                raw = %raw,
                                error = %parse_err,
                                "tool arguments unparseable; substituting {{}}"
                            );
                            *arguments = Value::Object(Default::default());
                        }
                    },
                }
                ClosedKind::Tool
            }
            _ => return,
        };
        let message = self.message.clone();
        let event = match closed {
            ClosedKind::Text => AssistantMessageEvent::TextEnd { index: pos, message },
            ClosedKind::Thinking => AssistantMessageEvent::ThinkingEnd { index: pos, message },
            ClosedKind::Tool => AssistantMessageEvent::ToolCallEnd { index: pos, message },
        };
        self.sink.push(event);
    }

    fn apply_usage(&mut self, update: UsageUpdate) {
        let usage = &mut self.message.usage;
        if let Some(v) = update.input {
            usage.input = v;
        }
        if let Some(v) = update.output {
            usage.output = v;
        }
        if let Some(v) = update.cache_read {
            usage.cache_read = v;
        }
        if let Some(v) = update.cache_write {
            usage.cache_write = v;
        }
        usage.recompute_total();
        usage.cost = catalog::compute_cost(&self.message.model, usage);
    }

    /// Close every block still open (stream ended without explicit stops).
    fn close_all_open(&mut self) {
        let open: Vec<u32> = self.open.iter().map(|(idx, _)| *idx).collect();
        for index in open {
            self.close_block(index);
        }
    }

    pub(crate) fn finish(&mut self, reason: StopReason) {
        self.close_all_open();
        self.message.stop_reason = reason;
        self.sink.push(AssistantMessageEvent::Done {
            reason,
            message: self.message.clone(),
        });
        self.sink.end(Ok(self.message.clone()));
    }

    pub(crate) fn fail(&mut self, reason: StopReason, error: &str) {
        // Transient routing state must not leak into the persisted message.
        self.open.clear();
        for block in self.message.content.iter_mut() {
            if let ContentBlock::ToolCall {
                partial_json,
                index,
                arguments,
                ..
            } = block
            {
                if let Some(raw) = partial_json.take() {
                    if let Some(v) = parse_partial_json(&scrub_lone_surrogates(&raw)) {
                        *arguments = v;
                    }
                }
                *index = None;
            }
        }
        self.message.stop_reason = reason;
        self.message.error_message = Some(error.to_string());
        self.sink.push(AssistantMessageEvent::Error {
            reason,
            message: self.message.clone(),
        });
        let err = match reason {
            StopReason::Aborted => StreamError::Aborted(error.to_string()),
            _ => StreamError::Failed(error.to_string()),
        };
        self.sink.end(Err(err));
    }
}

// ─── Stream framing helpers ───────────────────────────────────────────────────

/// Frame an SSE response into one JSON value per complete `data:` line.
///
/// Lines split across TCP chunks are carried in the scan buffer until the
/// terminating newline arrives.  The OpenAI `[DONE]` sentinel is forwarded as
/// a JSON string so drivers can translate it.
pub(crate) fn sse_lines(resp: reqwest::Response) -> WireStream {
    let byte_stream = resp.bytes_stream();
    let events = byte_stream
        .scan(String::new(), |buf, chunk| {
            let chunk = match chunk {
                Ok(b) => b,
                Err(e) => {
                    return futures::future::ready(Some(vec![Err(anyhow::anyhow!(e))]));
                }
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));
            let mut out: Vec<anyhow::Result<Value>> = Vec::new();
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim_end_matches('\r').to_string();
                buf.drain(..=pos);
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    out.push(Ok(Value::String("[DONE]".into())));
                    continue;
                }
                if let Ok(v) = serde_json::from_str::<Value>(data) {
                    out.push(Ok(v));
                }
            }
            futures::future::ready(Some(out))
        })
        .flat_map(futures::stream::iter);
    Box::pin(events)
}

/// Frame newline-delimited JSON carried inside binary chunks (Bedrock).
///
/// Partial lines are buffered across chunks; complete lines that fail to
/// parse are framing artifacts and are dropped with a debug log.
pub(crate) fn json_lines(resp: reqwest::Response) -> WireStream {
    let byte_stream = resp.bytes_stream();
    let events = byte_stream
        .scan(String::new(), |buf, chunk| {
            let chunk = match chunk {
                Ok(b) => b,
                Err(e) => {
                    return futures::future::ready(Some(vec![Err(anyhow::anyhow!(e))]));
                }
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));
            let mut out: Vec<anyhow::Result<Value>> = Vec::new();
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim().to_string();
                buf.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(v) => out.push(Ok(v)),
                    Err(_) => {
                        debug!(len = line.len(), "dropping unparseable stream line");
                    }
                }
            }
            futures::future::ready(Some(out))
        })
        .flat_map(futures::stream::iter);
    Box::pin(events)
}

/// Translate the canonical tool choice into Anthropic's `tool_choice` shape.
pub(crate) fn anthropic_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => serde_json::json!({ "type": "auto" }),
        ToolChoice::None => serde_json::json!({ "type": "none" }),
        ToolChoice::Required => serde_json::json!({ "type": "any" }),
        ToolChoice::Tool(name) => serde_json::json!({ "type": "tool", "name": name }),
    }
}

/// Translate the canonical tool choice into OpenAI's `tool_choice` shape.
pub(crate) fn openai_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => Value::String("auto".into()),
        ToolChoice::None => Value::String("none".into()),
        ToolChoice::Required => Value::String("required".into()),
        ToolChoice::Tool(name) => serde_json::json!({
            "type": "function",
            "function": { "name": name },
        }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
