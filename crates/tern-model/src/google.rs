// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini driver — native Generative Language API.
//!
//! Uses the `streamGenerateContent?alt=sse` endpoint.  Thinking arrives as
//! parts flagged `thought: true`; function calls arrive whole (never
//! fragmented), so each one is opened, filled, and closed within a single
//! decoded chunk.  Gemini does not assign call ids — the driver synthesizes
//! them from the function name and part position.
//!
//! # Auth
//! API key via the `x-goog-api-key` header.

use anyhow::{bail, Context as AnyhowContext};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::catalog;
use crate::provider::{
    sse_lines, ProviderDriver, StreamOptions, UsageUpdate, WireBlock, WireEvent, WireStream,
};
use crate::repair::prepare_for_submission;
use crate::types::{
    ContentBlock, Context, Message, StopReason, ToolChoice, ToolResultBlock, UserContent,
};

const TEXT_INDEX: u32 = 0;
const THINKING_INDEX: u32 = 1;
/// All function-call parts share one slot: each is opened and closed within
/// the same decoded chunk, so the slot is always free when the next one opens.
const TOOL_INDEX: u32 = 2;

pub struct GoogleDriver {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl GoogleDriver {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProviderDriver for GoogleDriver {
    fn api(&self) -> &'static str {
        "google-generative-ai"
    }

    fn provider(&self) -> &'static str {
        "google"
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

        let contents: Vec<Value> = prepared.iter().map(message_to_content).collect();

        let mut generation_config = json!({});
        if let Some(max) = context.options.max_tokens {
            generation_config["maxOutputTokens"] = json!(max);
        }
        if let Some(t) = context.options.temperature {
            generation_config["temperature"] = json!(t);
        }
        if let Some(budget) = context.options.reasoning.and_then(|r| r.budget_tokens()) {
            generation_config["thinkingConfig"] =
                json!({ "thinkingBudget": budget, "includeThoughts": true });
        }

        let mut body = json!({ "contents": contents });
        if !context.system.compiled.is_empty() {
            body["systemInstruction"] = json!({
                "parts": [{ "text": context.system.compiled }]
            });
        }
        if generation_config.as_object().is_some_and(|o| !o.is_empty()) {
            body["generationConfig"] = generation_config;
        }
        if !context.tools.is_empty() {
            let declarations: Vec<Value> = context
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
            if let Some(choice) = &options.tool_choice {
                body["toolConfig"] = json!({
                    "functionCallingConfig": match choice {
                        ToolChoice::Auto => json!({ "mode": "AUTO" }),
                        ToolChoice::None => json!({ "mode": "NONE" }),
                        ToolChoice::Required => json!({ "mode": "ANY" }),
                        ToolChoice::Tool(name) => {
                            json!({ "mode": "ANY", "allowedFunctionNames": [name] })
                        }
                    }
                });
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
        let key = self.api_key.as_deref().context("GEMINI_API_KEY not set")?;
        let body = self.build_params(model, context, options)?;

        debug!(model, "sending google request");

        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .context("Google request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Google error {status}: {text}");
        }
        Ok(sse_lines(resp))
    }

    fn decode_event(&self, raw: &Value) -> Vec<WireEvent> {
        decode_google_event(raw)
    }

    fn map_stop_reason(&self, raw: &str) -> StopReason {
        match raw {
            "STOP" => StopReason::Stop,
            "MAX_TOKENS" => StopReason::Length,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => StopReason::Error,
            other => crate::provider::default_stop_reason(other),
        }
    }
}

pub(crate) fn decode_google_event(raw: &Value) -> Vec<WireEvent> {
    let mut events = Vec::new();

    if let Some(usage) = raw.get("usageMetadata").filter(|u| u.is_object()) {
        events.push(WireEvent::Usage(UsageUpdate {
            input: usage["promptTokenCount"].as_u64(),
            output: usage["candidatesTokenCount"].as_u64(),
            cache_read: usage["cachedContentTokenCount"].as_u64(),
            ..UsageUpdate::default()
        }));
    }

    let Some(candidate) = raw["candidates"].get(0) else {
        if events.is_empty() {
            events.push(WireEvent::Ignore);
        }
        return events;
    };

    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for (part_index, part) in parts.iter().enumerate() {
            if let Some(text) = part["text"].as_str() {
                if part["thought"].as_bool().unwrap_or(false) {
                    events.push(WireEvent::ThinkingDelta {
                        index: THINKING_INDEX,
                        text: text.to_string(),
                    });
                } else {
                    events.push(WireEvent::TextDelta {
                        index: TEXT_INDEX,
                        text: text.to_string(),
                    });
                }
            }
            if let Some(call) = part.get("functionCall") {
                let name = call["name"].as_str().unwrap_or("").to_string();
                let args = call.get("args").cloned().unwrap_or(json!({}));
                events.push(WireEvent::BlockStart {
                    index: TOOL_INDEX,
                    block: WireBlock::ToolCall {
                        id: format!("{name}_{part_index}"),
                        name,
                    },
                });
                events.push(WireEvent::ToolJsonDelta {
                    index: TOOL_INDEX,
                    json: args.to_string(),
                });
                events.push(WireEvent::BlockStop { index: TOOL_INDEX });
            }
        }
    }

    // STOP is not reported: the drive loop infers ToolUse/Stop from content,
    // which Gemini's flat STOP cannot distinguish.
    if let Some(reason) = candidate["finishReason"].as_str() {
        if reason != "STOP" {
            events.push(WireEvent::StopReason(reason.to_string()));
        }
    }

    if events.is_empty() {
        events.push(WireEvent::Ignore);
    }
    events
}

fn message_to_content(message: &Message) -> Value {
    match message {
        Message::User(user) => {
            let parts = match &user.content {
                UserContent::Text(t) => json!([{ "text": t }]),
                UserContent::Blocks(blocks) => {
                    let parts: Vec<Value> = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => Some(json!({ "text": text })),
                            ContentBlock::Image { data, mime_type } => Some(json!({
                                "inlineData": { "mimeType": mime_type, "data": data }
                            })),
                            _ => None,
                        })
                        .collect();
                    json!(parts)
                }
            };
            json!({ "role": "user", "parts": parts })
        }
        Message::Assistant(a) => {
            let parts: Vec<Value> = a
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(json!({ "text": text })),
                    ContentBlock::ToolCall {
                        name, arguments, ..
                    } => Some(json!({
                        "functionCall": { "name": name, "args": arguments }
                    })),
                    ContentBlock::Thinking { .. } | ContentBlock::Image { .. } => None,
                })
                .collect();
            json!({ "role": "model", "parts": parts })
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
                "role": "user",
                "parts": [{
                    "functionResponse": {
                        "name": r.tool_name,
                        "response": { "output": text },
                    }
                }]
            })
        }
        Message::BashExecution { .. } => json!({ "role": "user", "parts": [] }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
