// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI Responses driver — the item-based streaming protocol.
//!
//! Unlike Completions, the Responses API has real block lifecycle events:
//! `response.output_item.added` / `.done` bracket each output item, and
//! deltas are routed by `output_index`.  That maps directly onto the
//! assembler's index space with no synthetic slots.

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

pub struct OpenAiResponsesDriver {
    api_key: Option<String>,
    base_url: String,
    extra_headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl OpenAiResponsesDriver {
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
impl ProviderDriver for OpenAiResponsesDriver {
    fn api(&self) -> &'static str {
        "openai-responses"
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

        let mut input: Vec<Value> = Vec::with_capacity(prepared.len());
        for message in &prepared {
            input.extend(message_to_items(message));
        }

        let mut body = json!({
            "model": model,
            "input": input,
            "stream": true,
        });
        if !context.system.compiled.is_empty() {
            body["instructions"] = json!(context.system.compiled);
        }
        if let Some(max) = context.options.max_tokens {
            body["max_output_tokens"] = json!(max);
        }
        if let Some(t) = context.options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(effort) = context.options.reasoning.and_then(|r| match r {
            tern_config::ThinkingLevel::Off => None,
            tern_config::ThinkingLevel::Low => Some("low"),
            tern_config::ThinkingLevel::Medium => Some("medium"),
            tern_config::ThinkingLevel::High => Some("high"),
        }) {
            body["reasoning"] = json!({ "effort": effort });
        }
        if !context.tools.is_empty() {
            let tools: Vec<Value> = context
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            if let Some(choice) = &options.tool_choice {
                body["tool_choice"] = match choice {
                    ToolChoice::Auto => json!("auto"),
                    ToolChoice::None => json!("none"),
                    ToolChoice::Required => json!("required"),
                    // The Responses API flattens the function reference.
                    ToolChoice::Tool(name) => json!({ "type": "function", "name": name }),
                };
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

        debug!(model, "sending openai responses request");

        let mut request = self
            .client
            .post(format!("{}/responses", self.base_url))
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
        decode_responses_event(raw)
    }

    fn map_stop_reason(&self, raw: &str) -> StopReason {
        match raw {
            "completed" => StopReason::Stop,
            "max_output_tokens" => StopReason::Length,
            "content_filter" => StopReason::Error,
            other => crate::provider::default_stop_reason(other),
        }
    }
}

pub(crate) fn decode_responses_event(raw: &Value) -> Vec<WireEvent> {
    let event_type = raw["type"].as_str().unwrap_or("");
    let index = raw["output_index"].as_u64().unwrap_or(0) as u32;
    match event_type {
        "response.output_item.added" => {
            let item = &raw["item"];
            match item["type"].as_str().unwrap_or("") {
                "message" => vec![WireEvent::BlockStart {
                    index,
                    block: WireBlock::Text,
                }],
                "reasoning" => vec![WireEvent::BlockStart {
                    index,
                    block: WireBlock::Thinking,
                }],
                "function_call" => vec![WireEvent::BlockStart {
                    index,
                    block: WireBlock::ToolCall {
                        id: item["call_id"].as_str().unwrap_or("").to_string(),
                        name: item["name"].as_str().unwrap_or("").to_string(),
                    },
                }],
                _ => vec![WireEvent::Ignore],
            }
        }
        "response.output_text.delta" => vec![WireEvent::TextDelta {
            index,
            text: raw["delta"].as_str().unwrap_or("").to_string(),
        }],
        "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
            vec![WireEvent::ThinkingDelta {
                index,
                text: raw["delta"].as_str().unwrap_or("").to_string(),
            }]
        }
        "response.function_call_arguments.delta" => vec![WireEvent::ToolJsonDelta {
            index,
            json: raw["delta"].as_str().unwrap_or("").to_string(),
        }],
        "response.output_item.done" => vec![WireEvent::BlockStop { index }],
        "response.completed" => {
            let mut events = usage_events(&raw["response"]);
            events.push(WireEvent::Done);
            events
        }
        "response.incomplete" => {
            let mut events = usage_events(&raw["response"]);
            let reason = raw["response"]["incomplete_details"]["reason"]
                .as_str()
                .unwrap_or("max_output_tokens");
            events.push(WireEvent::StopReason(reason.to_string()));
            events.push(WireEvent::Done);
            events
        }
        "response.failed" => {
            let message = raw["response"]["error"]["message"]
                .as_str()
                .unwrap_or("response failed")
                .to_string();
            vec![WireEvent::Failure(message)]
        }
        _ => vec![WireEvent::Ignore],
    }
}

fn usage_events(response: &Value) -> Vec<WireEvent> {
    let usage = &response["usage"];
    if usage.is_object() {
        vec![WireEvent::Usage(UsageUpdate {
            input: usage["input_tokens"].as_u64(),
            output: usage["output_tokens"].as_u64(),
            cache_read: usage["input_tokens_details"]["cached_tokens"].as_u64(),
            ..UsageUpdate::default()
        })]
    } else {
        Vec::new()
    }
}

/// One canonical message can expand into several Responses input items
/// (tool calls and their outputs are top-level items, not message content).
fn message_to_items(message: &Message) -> Vec<Value> {
    match message {
        Message::User(user) => {
            let content = match &user.content {
                UserContent::Text(t) => json!([{ "type": "input_text", "text": t }]),
                UserContent::Blocks(blocks) => {
                    let parts: Vec<Value> = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => {
                                Some(json!({ "type": "input_text", "text": text }))
                            }
                            ContentBlock::Image { data, mime_type } => Some(json!({
                                "type": "input_image",
                                "image_url": format!("data:{mime_type};base64,{data}"),
                            })),
                            _ => None,
                        })
                        .collect();
                    json!(parts)
                }
            };
            vec![json!({ "role": "user", "content": content })]
        }
        Message::Assistant(a) => {
            let mut items = Vec::new();
            let mut text = String::new();
            for block in &a.content {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(t),
                    ContentBlock::ToolCall {
                        id,
                        name,
                        arguments,
                        ..
                    } => items.push(json!({
                        "type": "function_call",
                        "call_id": id,
                        "name": name,
                        "arguments": arguments.to_string(),
                    })),
                    ContentBlock::Thinking { .. } | ContentBlock::Image { .. } => {}
                }
            }
            if !text.is_empty() {
                items.insert(
                    0,
                    json!({
                        "role": "assistant",
                        "content": [{ "type": "output_text", "text": text }],
                    }),
                );
            }
            items
        }
        Message::ToolResult(r) => {
            let output: String = r
                .content
                .iter()
                .map(|b| match b {
                    ToolResultBlock::Text { text } => text.clone(),
                    ToolResultBlock::Image { .. } => "[image]".to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n");
            vec![json!({
                "type": "function_call_output",
                "call_id": r.tool_call_id,
                "output": output,
            })]
        }
        Message::BashExecution { .. } => vec![],
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssistantMessage, ContextMessages, SystemPart, SystemPrompt};

    fn driver() -> OpenAiResponsesDriver {
        OpenAiResponsesDriver::new(Some("key".into()), None, vec![])
    }

    fn ctx(messages: Vec<Message>) -> Context {
        Context {
            system: SystemPrompt::new(vec![SystemPart {
                name: "base".into(),
                text: "Be helpful.".into(),
            }]),
            tools: vec![],
            messages: ContextMessages {
                cached: vec![],
                uncached: messages,
            },
            options: Default::default(),
            meta: Default::default(),
        }
    }

    #[test]
    fn output_item_added_message_opens_text_block() {
        let raw = json!({
            "type": "response.output_item.added",
            "output_index": 0,
            "item": { "type": "message" }
        });
        assert!(matches!(
            &decode_responses_event(&raw)[0],
            WireEvent::BlockStart { index: 0, block: WireBlock::Text }
        ));
    }

    #[test]
    fn output_item_added_function_call_carries_call_id() {
        let raw = json!({
            "type": "response.output_item.added",
            "output_index": 2,
            "item": { "type": "function_call", "call_id": "call_9", "name": "calc" }
        });
        match &decode_responses_event(&raw)[0] {
            WireEvent::BlockStart {
                index: 2,
                block: WireBlock::ToolCall { id, name },
            } => {
                assert_eq!(id, "call_9");
                assert_eq!(name, "calc");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn text_and_reasoning_deltas_route_by_output_index() {
        let text = json!({
            "type": "response.output_text.delta",
            "output_index": 1,
            "delta": "hi"
        });
        assert!(matches!(
            &decode_responses_event(&text)[0],
            WireEvent::TextDelta { index: 1, text } if text == "hi"
        ));

        let reasoning = json!({
            "type": "response.reasoning_summary_text.delta",
            "output_index": 0,
            "delta": "hmm"
        });
        assert!(matches!(
            &decode_responses_event(&reasoning)[0],
            WireEvent::ThinkingDelta { index: 0, text } if text == "hmm"
        ));
    }

    #[test]
    fn arguments_delta_and_item_done() {
        let args = json!({
            "type": "response.function_call_arguments.delta",
            "output_index": 3,
            "delta": "{\"x\":"
        });
        assert!(matches!(
            &decode_responses_event(&args)[0],
            WireEvent::ToolJsonDelta { index: 3, json } if json == "{\"x\":"
        ));

        let done = json!({ "type": "response.output_item.done", "output_index": 3 });
        assert!(matches!(
            &decode_responses_event(&done)[0],
            WireEvent::BlockStop { index: 3 }
        ));
    }

    #[test]
    fn completed_carries_usage_then_done() {
        let raw = json!({
            "type": "response.completed",
            "response": { "usage": {
                "input_tokens": 11,
                "output_tokens": 7,
                "input_tokens_details": { "cached_tokens": 5 }
            }}
        });
        let events = decode_responses_event(&raw);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            WireEvent::Usage(UsageUpdate { input: Some(11), output: Some(7), cache_read: Some(5), .. })
        ));
        assert!(matches!(events[1], WireEvent::Done));
    }

    #[test]
    fn incomplete_maps_reason_to_length() {
        let raw = json!({
            "type": "response.incomplete",
            "response": { "incomplete_details": { "reason": "max_output_tokens" } }
        });
        let events = decode_responses_event(&raw);
        assert!(matches!(
            &events[0],
            WireEvent::StopReason(r) if r == "max_output_tokens"
        ));
        assert_eq!(
            driver().map_stop_reason("max_output_tokens"),
            StopReason::Length
        );
    }

    #[test]
    fn failed_is_failure() {
        let raw = json!({
            "type": "response.failed",
            "response": { "error": { "message": "quota exceeded" } }
        });
        assert!(matches!(
            &decode_responses_event(&raw)[0],
            WireEvent::Failure(m) if m == "quota exceeded"
        ));
    }

    #[test]
    fn build_params_uses_instructions_and_input_items() {
        let body = driver()
            .build_params("gpt-5", &ctx(vec![Message::user("hi", 0)]), &StreamOptions::default())
            .unwrap();
        assert_eq!(body["instructions"], "Be helpful.");
        assert_eq!(body["input"][0]["role"], "user");
        assert_eq!(body["input"][0]["content"][0]["type"], "input_text");
    }

    #[test]
    fn assistant_tool_call_becomes_function_call_item_pair() {
        let assistant = Message::Assistant(AssistantMessage {
            content: vec![ContentBlock::tool_call("call_1", "calc", json!({"a": 1}))],
            stop_reason: StopReason::ToolUse,
            ..AssistantMessage::empty("openai-responses", "openai", "gpt-5", 0)
        });
        let result =
            Message::tool_result("call_1", "calc", vec![ToolResultBlock::text("2")], false, 1);
        let body = driver()
            .build_params(
                "gpt-5",
                &ctx(vec![Message::user("go", 0), assistant, result]),
                &StreamOptions::default(),
            )
            .unwrap();
        let input = body["input"].as_array().unwrap();
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["call_id"], "call_1");
        assert_eq!(input[2]["type"], "function_call_output");
        assert_eq!(input[2]["call_id"], "call_1");
        assert_eq!(input[2]["output"], "2");
    }
}
