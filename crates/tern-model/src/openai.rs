// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI Chat Completions driver — SSE streaming with parallel tool calls.
//!
//! The Completions protocol has no block lifecycle events: content arrives
//! as bare deltas and tool calls are keyed by a `tool_calls[].index` that is
//! independent of content.  The driver maps them into one index space —
//! text at 0, reasoning at 1, tool call *i* at `TOOL_INDEX_BASE + i` — and
//! lets the assembler auto-open blocks on first delta.

use anyhow::{bail, Context as AnyhowContext};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::catalog;
use crate::provider::{
    openai_tool_choice, sse_lines, ProviderDriver, StreamOptions, UsageUpdate, WireBlock,
    WireEvent, WireStream,
};
use crate::repair::prepare_for_submission;
use crate::types::{
    ContentBlock, Context, Message, StopReason, ToolResultBlock, UserContent,
};

const TEXT_INDEX: u32 = 0;
const THINKING_INDEX: u32 = 1;
const TOOL_INDEX_BASE: u32 = 10;

pub struct OpenAiDriver {
    api_key: Option<String>,
    base_url: String,
    extra_headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl OpenAiDriver {
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        extra_headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            extra_headers,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProviderDriver for OpenAiDriver {
    fn api(&self) -> &'static str {
        "openai-completions"
    }

    fn provider(&self) -> &'static str {
        "openai"
    }

    fn build_params(
        &self,
        model: &str,
        context: &Context,
        options: &StreamOptions,
    ) -> anyhow::Result<Value> {
        let supports_images = catalog::supports_images(model);
        let all: Vec<Message> = context.messages.all().cloned().collect();
        let prepared = prepare_for_submission(&all, supports_images);

        let mut messages: Vec<Value> = Vec::with_capacity(prepared.len() + 1);
        if !context.system.compiled.is_empty() {
            messages.push(json!({ "role": "system", "content": context.system.compiled }));
        }
        for message in &prepared {
            messages.push(message_to_wire(message));
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(max) = context.options.max_tokens {
            body["max_completion_tokens"] = json!(max);
        }
        if let Some(t) = context.options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(effort) = context.options.reasoning.and_then(reasoning_effort) {
            body["reasoning_effort"] = json!(effort);
        }
        if !context.tools.is_empty() {
            let tools: Vec<Value> = context
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            if let Some(choice) = &options.tool_choice {
                body["tool_choice"] = openai_tool_choice(choice);
            }
        }
        Ok(body)
    }

    async fn create_event_stream(
        &self,
        model: &str,
        context: &Context,
        options: &StreamOptions,
    ) -> anyhow::Result<WireStream> {
        let key = self.api_key.as_deref().context("OPENAI_API_KEY not set")?;
        let body = self.build_params(model, context, options)?;

        debug!(model, "sending openai completions request");

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key);
        for (name, value) in &self.extra_headers {
            request = request.header(name, value);
        }
        let resp = request
            .json(&body)
            .send()
            .await
            .context("OpenAI request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("OpenAI error {status}: {text}");
        }
        Ok(sse_lines(resp))
    }

    fn decode_event(&self, raw: &Value) -> Vec<WireEvent> {
        decode_completions_event(raw)
    }

    fn map_stop_reason(&self, raw: &str) -> StopReason {
        match raw {
            "stop" => StopReason::Stop,
            "length" => StopReason::Length,
            "tool_calls" | "function_call" => StopReason::ToolUse,
            "content_filter" => StopReason::Error,
            _ => StopReason::Stop,
        }
    }
}

fn reasoning_effort(level: tern_config::ThinkingLevel) -> Option<&'static str> {
    match level {
        tern_config::ThinkingLevel::Off => None,
        tern_config::ThinkingLevel::Low => Some("low"),
        tern_config::ThinkingLevel::Medium => Some("medium"),
        tern_config::ThinkingLevel::High => Some("high"),
    }
}

pub(crate) fn decode_completions_event(raw: &Value) -> Vec<WireEvent> {
    if raw.as_str() == Some("[DONE]") {
        return vec![WireEvent::Done];
    }
    let mut events = Vec::new();

    // Usage arrives on a final chunk whose choices array is empty.
    if let Some(usage) = raw.get("usage").filter(|u| u.is_object()) {
        events.push(WireEvent::Usage(UsageUpdate {
            input: usage["prompt_tokens"].as_u64(),
            output: usage["completion_tokens"].as_u64(),
            cache_read: usage["prompt_tokens_details"]["cached_tokens"].as_u64(),
            ..UsageUpdate::default()
        }));
    }

    let Some(choice) = raw["choices"].get(0) else {
        if events.is_empty() {
            events.push(WireEvent::Ignore);
        }
        return events;
    };
    let delta = &choice["delta"];

    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            events.push(WireEvent::TextDelta {
                index: TEXT_INDEX,
                text: text.to_string(),
            });
        }
    }
    // reasoning_content is emitted by reasoning models and compatible
    // gateways; fall back to `reasoning` for older proxies.
    let thinking = delta["reasoning_content"]
        .as_str()
        .or_else(|| delta["reasoning"].as_str());
    if let Some(text) = thinking {
        if !text.is_empty() {
            events.push(WireEvent::ThinkingDelta {
                index: THINKING_INDEX,
                text: text.to_string(),
            });
        }
    }
    if let Some(tool_calls) = delta["tool_calls"].as_array() {
        for tc in tool_calls {
            let slot = tc["index"].as_u64().unwrap_or(0) as u32 + TOOL_INDEX_BASE;
            let id = tc["id"].as_str().unwrap_or("");
            let name = tc["function"]["name"].as_str().unwrap_or("");
            if !id.is_empty() || !name.is_empty() {
                events.push(WireEvent::BlockStart {
                    index: slot,
                    block: WireBlock::ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                    },
                });
            }
            if let Some(args) = tc["function"]["arguments"].as_str() {
                if !args.is_empty() {
                    events.push(WireEvent::ToolJsonDelta {
                        index: slot,
                        json: args.to_string(),
                    });
                }
            }
        }
    }
    if let Some(reason) = choice["finish_reason"].as_str() {
        events.push(WireEvent::StopReason(reason.to_string()));
    }

    if events.is_empty() {
        events.push(WireEvent::Ignore);
    }
    events
}

fn message_to_wire(message: &Message) -> Value {
    match message {
        Message::User(user) => {
            let content = match &user.content {
                UserContent::Text(t) => json!(t),
                UserContent::Blocks(blocks) => {
                    let parts: Vec<Value> = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => {
                                Some(json!({ "type": "text", "text": text }))
                            }
                            ContentBlock::Image { data, mime_type } => Some(json!({
                                "type": "image_url",
                                "image_url": { "url": format!("data:{mime_type};base64,{data}") },
                            })),
                            _ => None,
                        })
                        .collect();
                    json!(parts)
                }
            };
            json!({ "role": "user", "content": content })
        }
        Message::Assistant(a) => {
            let mut text = String::new();
            let mut tool_calls: Vec<Value> = Vec::new();
            for block in &a.content {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(t),
                    ContentBlock::ToolCall {
                        id,
                        name,
                        arguments,
                        ..
                    } => tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": arguments.to_string(),
                        }
                    })),
                    // The Completions protocol cannot resubmit reasoning or
                    // assistant images.
                    ContentBlock::Thinking { .. } | ContentBlock::Image { .. } => {}
                }
            }
            let mut wire = json!({ "role": "assistant" });
            wire["content"] = if text.is_empty() {
                Value::Null
            } else {
                json!(text)
            };
            if !tool_calls.is_empty() {
                wire["tool_calls"] = json!(tool_calls);
            }
            wire
        }
        Message::ToolResult(r) => {
            let text: String = r
                .content
                .iter()
                .map(|b| match b {
                    ToolResultBlock::Text { text } => text.clone(),
                    ToolResultBlock::Image { .. } => "[image]".to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n");
            json!({
                "role": "tool",
                "tool_call_id": r.tool_call_id,
                "content": text,
            })
        }
        Message::BashExecution { .. } => json!({ "role": "user", "content": "" }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
