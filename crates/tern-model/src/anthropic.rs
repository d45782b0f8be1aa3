// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic Messages driver — native SSE streaming API.
//!
//! Thinking blocks round-trip with their signature so resubmitted reasoning
//! passes the provider's provenance check.  The prompt-cache boundary of the
//! envelope is translated into a `cache_control` breakpoint on the last
//! cached message.

use anyhow::{bail, Context as AnyhowContext};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::provider::{
    anthropic_tool_choice, sse_lines, ProviderDriver, StreamOptions, UsageUpdate, WireBlock,
    WireEvent, WireStream,
};
use crate::repair::prepare_for_submission;
use crate::types::{Context, ContentBlock, Message, UserContent};
use crate::catalog;

pub struct AnthropicDriver {
    api_key: Option<String>,
    base_url: String,
    extra_headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl AnthropicDriver {
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        extra_headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            extra_headers,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProviderDriver for AnthropicDriver {
    fn api(&self) -> &'static str {
        "anthropic-messages"
    }

    fn provider(&self) -> &'static str {
        "anthropic"
    }

    fn build_params(
        &self,
        model: &str,
        context: &Context,
        options: &StreamOptions,
    ) -> anyhow::Result<Value> {
        build_messages_params(model, context, options, true)
    }

    async fn create_event_stream(
        &self,
        model: &str,
        context: &Context,
        options: &StreamOptions,
    ) -> anyhow::Result<WireStream> {
        let key = self
            .api_key
            .as_deref()
            .context("ANTHROPIC_API_KEY not set")?;
        let body = self.build_params(model, context, options)?;

        debug!(model, "sending anthropic request");

        let mut request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01");
        for (name, value) in &self.extra_headers {
            request = request.header(name, value);
        }

        let resp = request
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Anthropic error {status}: {text}");
        }

        Ok(sse_lines(resp))
    }

    fn decode_event(&self, raw: &Value) -> Vec<WireEvent> {
        decode_messages_event(raw)
    }
}

/// Decode one Anthropic Messages stream event.  Shared with the Bedrock
/// driver, which carries the same event shapes in its own framing.
pub(crate) fn decode_messages_event(v: &Value) -> Vec<WireEvent> {
    let event_type = v["type"].as_str().unwrap_or("");
    match event_type {
        "message_start" => {
            let usage = &v["message"]["usage"];
            if usage.is_object() {
                vec![WireEvent::Usage(UsageUpdate {
                    input: usage["input_tokens"].as_u64(),
                    cache_read: usage["cache_read_input_tokens"].as_u64(),
                    cache_write: usage["cache_creation_input_tokens"].as_u64(),
                    ..UsageUpdate::default()
                })]
            } else {
                vec![WireEvent::Ignore]
            }
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            match block["type"].as_str().unwrap_or("") {
                "text" => {
                    let mut events = vec![WireEvent::BlockStart {
                        index,
                        block: WireBlock::Text,
                    }];
                    // Some backends put the first fragment on the start event.
                    if let Some(text) = block["text"].as_str() {
                        if !text.is_empty() {
                            events.push(WireEvent::TextDelta {
                                index,
                                text: text.to_string(),
                            });
                        }
                    }
                    events
                }
                "thinking" => vec![WireEvent::BlockStart {
                    index,
                    block: WireBlock::Thinking,
                }],
                "tool_use" => vec![WireEvent::BlockStart {
                    index,
                    block: WireBlock::ToolCall {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                    },
                }],
                _ => vec![WireEvent::Ignore],
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => vec![WireEvent::TextDelta {
                    index,
                    text: delta["text"].as_str().unwrap_or("").to_string(),
                }],
                "thinking_delta" => vec![WireEvent::ThinkingDelta {
                    index,
                    text: delta["thinking"].as_str().unwrap_or("").to_string(),
                }],
                "signature_delta" => vec![WireEvent::SignatureDelta {
                    index,
                    signature: delta["signature"].as_str().unwrap_or("").to_string(),
                }],
                "input_json_delta" => vec![WireEvent::ToolJsonDelta {
                    index,
                    json: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }],
                _ => vec![WireEvent::Ignore],
            }
        }
        "content_block_stop" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            vec![WireEvent::BlockStop { index }]
        }
        "message_delta" => {
            let mut events = Vec::new();
            if let Some(raw) = v["delta"]["stop_reason"].as_str() {
                events.push(WireEvent::StopReason(raw.to_string()));
            }
            if let Some(output) = v["usage"]["output_tokens"].as_u64() {
                events.push(WireEvent::Usage(UsageUpdate {
                    output: Some(output),
                    ..UsageUpdate::default()
                }));
            }
            if events.is_empty() {
                events.push(WireEvent::Ignore);
            }
            events
        }
        "message_stop" => vec![WireEvent::Done],
        "error" => {
            let message = v["error"]["message"]
                .as_str()
                .unwrap_or("provider error")
                .to_string();
            vec![WireEvent::Failure(message)]
        }
        // ping and future event types
        _ => vec![WireEvent::Ignore],
    }
}

/// Build a Messages-API request body.  Shared with the Bedrock driver, which
/// swaps the `stream`/`model` fields for its own envelope.
pub(crate) fn build_messages_params(
    model: &str,
    context: &Context,
    options: &StreamOptions,
    include_model: bool,
) -> anyhow::Result<Value> {
    let supports_images = catalog::supports_images(model);
    let all: Vec<Message> = context.messages.all().cloned().collect();
    let prepared = prepare_for_submission(&all, supports_images);

    // The cache boundary is expressed as a breakpoint on the last message
    // that is still part of the cached prefix.
    let cached_count = context.messages.cached.len().min(prepared.len());
    let mut messages = Vec::with_capacity(prepared.len());
    for (i, message) in prepared.iter().enumerate() {
        let mut wire = message_to_wire(message);
        if cached_count > 0 && i + 1 == cached_count {
            mark_last_block_cached(&mut wire);
        }
        messages.push(wire);
    }

    let max_tokens = context.options.max_tokens.unwrap_or(4096);
    let mut body = json!({
        "messages": messages,
        "max_tokens": max_tokens,
    });
    if include_model {
        body["model"] = json!(model);
        body["stream"] = json!(true);
    }
    if let Some(t) = context.options.temperature {
        body["temperature"] = json!(t);
    }
    if !context.system.compiled.is_empty() {
        body["system"] = json!([{
            "type": "text",
            "text": context.system.compiled,
            "cache_control": { "type": "ephemeral" },
        }]);
    }
    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!(tools);
        if let Some(choice) = &options.tool_choice {
            body["tool_choice"] = anthropic_tool_choice(choice);
        }
    }
    if let Some(budget) = context.options.reasoning.and_then(|r| r.budget_tokens()) {
        body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
    }
    Ok(body)
}

fn message_to_wire(message: &Message) -> Value {
    match message {
        Message::User(user) => {
            let content = match &user.content {
                UserContent::Text(t) => json!(t),
                UserContent::Blocks(blocks) => {
                    json!(blocks.iter().map(content_block_to_wire).collect::<Vec<_>>())
                }
            };
            json!({ "role": "user", "content": content })
        }
        Message::Assistant(a) => {
            let content: Vec<Value> = a.content.iter().map(content_block_to_wire).collect();
            json!({ "role": "assistant", "content": content })
        }
        Message::ToolResult(r) => {
            let content: Vec<Value> = r
                .content
                .iter()
                .map(|b| match b {
                    crate::types::ToolResultBlock::Text { text } => {
                        json!({ "type": "text", "text": text })
                    }
                    crate::types::ToolResultBlock::Image { data, mime_type } => json!({
                        "type": "image",
                        "source": { "type": "base64", "media_type": mime_type, "data": data },
                    }),
                })
                .collect();
            json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": r.tool_call_id,
                    "content": content,
                    "is_error": r.is_error,
                }]
            })
        }
        // Rendered to user text during prepare_for_submission.
        Message::BashExecution { .. } => json!({ "role": "user", "content": "" }),
    }
}

fn content_block_to_wire(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::Thinking {
            thinking,
            signature,
        } => json!({
            "type": "thinking",
            "thinking": thinking,
            "signature": signature.as_deref().unwrap_or(""),
        }),
        ContentBlock::Image { data, mime_type } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": mime_type, "data": data },
        }),
        ContentBlock::ToolCall {
            id,
            name,
            arguments,
            ..
        } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": arguments,
        }),
    }
}

fn mark_last_block_cached(wire: &mut Value) {
    match &mut wire["content"] {
        Value::Array(blocks) => {
            if let Some(last) = blocks.last_mut() {
                last["cache_control"] = json!({ "type": "ephemeral" });
            }
        }
        Value::String(text) => {
            // Plain-string content cannot carry a breakpoint; promote it to
            // a single text block first.
            let text = std::mem::take(text);
            wire["content"] = json!([{
                "type": "text",
                "text": text,
                "cache_control": { "type": "ephemeral" },
            }]);
        }
        _ => {}
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
