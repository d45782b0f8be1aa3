// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted driver for tests.  Replays pre-scripted wire events (in the
//! Messages-API event shapes) through the real decode and assembly path,
//! and records the request body each call built so tests can assert on
//! serialization without network access.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::anthropic::{build_messages_params, decode_messages_event};
use crate::provider::{ProviderDriver, StreamOptions, WireEvent, WireStream};
use crate::types::Context;

pub struct ScriptedDriver {
    /// Ordered scripts; each `complete` call consumes the front one.
    scripts: Mutex<Vec<Vec<Value>>>,
    /// Request body built for the most recent call.
    pub last_params: Arc<Mutex<Option<Value>>>,
}

impl ScriptedDriver {
    pub fn new(scripts: Vec<Vec<Value>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            last_params: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: a single text reply streamed in two fragments.
    pub fn text_reply(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut mid = text.len() / 2;
        while !text.is_char_boundary(mid) {
            mid -= 1;
        }
        let (a, b) = text.split_at(mid);
        Self::new(vec![text_script(a, b)])
    }

    /// Convenience: a tool call streamed as JSON fragments, then (after the
    /// tool result round-trip) a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        fragments: Vec<&str>,
        final_text: impl Into<String>,
    ) -> Self {
        let final_text = final_text.into();
        Self::new(vec![
            tool_script(&tool_id.into(), &tool_name.into(), &fragments),
            text_script(&final_text, ""),
        ])
    }
}

/// Script for one streamed text reply, in Messages-API event shapes.
pub fn text_script(first: &str, second: &str) -> Vec<Value> {
    let mut events = vec![
        json!({"type": "message_start", "message": {"usage": {"input_tokens": 12}}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": first}}),
    ];
    if !second.is_empty() {
        events.push(json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "text_delta", "text": second}
        }));
    }
    events.extend([
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 5}}),
        json!({"type": "message_stop"}),
    ]);
    events
}

/// Script for one streamed tool call with fragmented JSON arguments.
pub fn tool_script(id: &str, name: &str, fragments: &[&str]) -> Vec<Value> {
    let mut events = vec![
        json!({"type": "message_start", "message": {"usage": {"input_tokens": 20}}}),
        json!({"type": "content_block_start", "index": 0,
               "content_block": {"type": "tool_use", "id": id, "name": name}}),
    ];
    for fragment in fragments {
        events.push(json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "input_json_delta", "partial_json": fragment}
        }));
    }
    events.extend([
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 8}}),
        json!({"type": "message_stop"}),
    ]);
    events
}

#[async_trait]
impl ProviderDriver for ScriptedDriver {
    fn api(&self) -> &'static str {
        "mock"
    }

    fn provider(&self) -> &'static str {
        "mock"
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
        *self.last_params.lock().unwrap() = Some(self.build_params(model, context, options)?);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                text_script("[no more scripts]", "")
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<Value>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(wrapped)))
    }

    fn decode_event(&self, raw: &Value) -> Vec<WireEvent> {
        decode_messages_event(raw)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::provider::stream;
    use crate::types::{ContextMessages, Message, StopReason, SystemPrompt};

    fn ctx(messages: Vec<Message>) -> Context {
        Context {
            system: SystemPrompt::default(),
            tools: vec![],
            messages: ContextMessages {
                cached: vec![],
                uncached: messages,
            },
            options: Default::default(),
            meta: Default::default(),
        }
    }

    #[tokio::test]
    async fn scripted_text_reply_streams_to_done() {
        let driver = Arc::new(ScriptedDriver::text_reply("hello world"));
        let mut s = stream(
            driver,
            "mock-model",
            ctx(vec![Message::user("hi", 0)]),
            StreamOptions::default(),
        );
        let message = s.result().await.unwrap();
        assert_eq!(message.text(), "hello world");
        assert_eq!(message.stop_reason, StopReason::Stop);
        assert_eq!(message.usage.input, 12);
        assert_eq!(message.usage.output, 5);
    }

    #[tokio::test]
    async fn scripted_driver_records_last_params() {
        let driver = Arc::new(ScriptedDriver::text_reply("ok"));
        let last = driver.last_params.clone();
        let mut s = stream(
            driver,
            "mock-model",
            ctx(vec![Message::user("inspect me", 0)]),
            StreamOptions::default(),
        );
        s.result().await.unwrap();
        let params = last.lock().unwrap().clone().unwrap();
        assert_eq!(params["messages"][0]["content"], "inspect me");
    }

    #[tokio::test]
    async fn exhausted_scripts_fall_back_to_placeholder() {
        let driver = Arc::new(ScriptedDriver::new(vec![]));
        let mut s = stream(
            driver,
            "mock-model",
            ctx(vec![Message::user("hi", 0)]),
            StreamOptions::default(),
        );
        let message = s.result().await.unwrap();
        assert!(message.text().contains("[no more scripts]"));
    }
}
