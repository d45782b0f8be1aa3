// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent turn loop: queueing, provider invocation, tool dispatch, and
//! lifecycle event emission.
//!
//! One queued user message is one turn.  A turn may take several provider
//! round-trips when the model calls tools; tool execution is sequential and
//! in content order.  Cancellation is edge-triggered through a single
//! [`CancellationToken`] that propagates caller → agent → adapter → tool.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tern_config::{ModelConfig, ThinkingLevel};
use tern_model::{
    catalog, AssistantMessage, Attachment, ContentBlock, Context, ContextMessages, ContextMeta,
    EventStream, Message, RequestOptions, StopReason, StreamOptions, SystemPart, SystemPrompt,
    ToolDef, ToolResultBlock, UserContent, UserMessage,
};

use crate::envelope::{apply_patch, ContextPatchOp, PatchError};
use crate::events::AgentEvent;
use crate::session::SessionTree;
use crate::skills::{diff_skills, skills_system_part, Skill, SkillDiff, SKILLS_PART};

/// Injected streaming function.  Defaults to the configured driver, but
/// tests and alternative transports substitute their own.
pub type StreamFn = Arc<
    dyn Fn(String, Context, StreamOptions) -> EventStream<tern_model::AssistantMessageEvent, AssistantMessage>
        + Send
        + Sync,
>;

/// Best-effort partial-result channel handed to running tools.  Calls fan
/// out to observers as `ToolResultPartial`; they never reach the session
/// tree or the provider.
pub type ToolUpdateFn = Arc<dyn Fn(Vec<ToolResultBlock>) + Send + Sync>;

/// Transforms a document attachment into content blocks when the host has
/// an extractor for its type.
pub type AttachmentTransformer = Arc<dyn Fn(&Attachment) -> Vec<ContentBlock> + Send + Sync>;

type Listener = Box<dyn Fn(&AgentEvent) + Send>;
type Listeners = Arc<Mutex<Vec<Listener>>>;

#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str {
        ""
    }
    /// JSON Schema of the argument object.
    fn parameters(&self) -> Value;
    /// Execute one call.  Implementations should watch `cancel` and unwind
    /// promptly when it fires; `on_update` may be called on each progress
    /// tick and must not be awaited.
    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: Value,
        cancel: CancellationToken,
        on_update: ToolUpdateFn,
    ) -> anyhow::Result<Vec<ToolResultBlock>>;
}

pub struct AgentInit {
    pub model: ModelConfig,
    pub system_parts: Vec<SystemPart>,
    pub tools: Vec<Arc<dyn AgentTool>>,
    pub thinking_level: ThinkingLevel,
    pub session_name: Option<String>,
    pub cwd: String,
    /// Override the provider transport; `None` builds the configured driver.
    pub stream_fn: Option<StreamFn>,
    pub attachment_transformer: Option<AttachmentTransformer>,
}

enum TurnOutcome {
    /// Turn finished cleanly; continue draining the queue.
    Completed,
    /// Errored or aborted; stop draining (the queue is preserved).
    Stopped,
}

pub struct Agent {
    model: ModelConfig,
    system_parts: Vec<SystemPart>,
    thinking_level: ThinkingLevel,
    tools: Vec<Arc<dyn AgentTool>>,
    skills: Vec<Skill>,
    tree: SessionTree,
    queue: VecDeque<Message>,
    pending_patches: Vec<ContextPatchOp>,
    listeners: Listeners,
    stream_fn: StreamFn,
    attachment_transformer: Option<AttachmentTransformer>,
    cancel: CancellationToken,
    is_streaming: bool,
    last_error: Option<String>,
    turn_index: u64,
    request_index: u64,
}

impl Agent {
    pub fn new(init: AgentInit) -> anyhow::Result<Self> {
        let stream_fn = match init.stream_fn {
            Some(f) => f,
            None => {
                let driver = tern_model::from_config(&init.model)?;
                Arc::new(
                    move |model: String, context: Context, options: StreamOptions| {
                        tern_model::stream(driver.clone(), &model, context, options)
                    },
                ) as StreamFn
            }
        };
        let fingerprint = SystemPrompt::new(init.system_parts.clone()).compiled;
        let mut tree = SessionTree::new(&init.cwd, &fingerprint, &init.model.name);
        tree.set_name(init.session_name);
        Ok(Self {
            model: init.model,
            system_parts: init.system_parts,
            thinking_level: init.thinking_level,
            tools: init.tools,
            skills: Vec::new(),
            tree,
            queue: VecDeque::new(),
            pending_patches: Vec::new(),
            listeners: Arc::new(Mutex::new(Vec::new())),
            stream_fn,
            attachment_transformer: init.attachment_transformer,
            cancel: CancellationToken::new(),
            is_streaming: false,
            last_error: None,
            turn_index: 0,
            request_index: 0,
        })
    }

    // ── Observation ───────────────────────────────────────────────────────────

    /// Subscribe to lifecycle events.  Handlers run synchronously in
    /// subscription order; a panicking handler is contained and logged.
    pub fn on(&mut self, handler: impl Fn(&AgentEvent) + Send + 'static) {
        self.listeners.lock().unwrap().push(Box::new(handler));
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn session(&self) -> &SessionTree {
        &self.tree
    }

    pub fn session_mut(&mut self) -> &mut SessionTree {
        &mut self.tree
    }

    pub fn skills(&self) -> &[Skill] {
        &self.skills
    }

    fn emit(&self, event: AgentEvent) {
        emit_to(&self.listeners, &event);
    }

    fn emit_state(&self) {
        self.emit(AgentEvent::StateUpdate {
            is_streaming: self.is_streaming,
            queued: self.queue.len(),
            error: self.last_error.clone(),
        });
    }

    // ── Queue operations (no provider traffic) ────────────────────────────────

    pub fn queue_message(&mut self, message: Message) {
        self.queue.push_back(message);
        self.emit_state();
    }

    pub fn get_message_queue(&self) -> Vec<Message> {
        self.queue.iter().cloned().collect()
    }

    /// Replace the text of a queued user message found by timestamp.
    ///
    /// The scan takes the first queued message with the matching timestamp;
    /// when that message is not a user message the call returns `false`
    /// without searching further.
    pub fn update_queued_user_message_by_timestamp(&mut self, timestamp: i64, text: &str) -> bool {
        let Some(pos) = self.queue.iter().position(|m| m.timestamp() == timestamp) else {
            return false;
        };
        match &mut self.queue[pos] {
            Message::User(user) => {
                user.content = UserContent::Blocks(vec![ContentBlock::text(text)]);
                true
            }
            _ => false,
        }
    }

    /// Remove a queued user message found by timestamp; same first-match
    /// semantics as the update.
    pub fn remove_queued_user_message_by_timestamp(&mut self, timestamp: i64) -> bool {
        let Some(pos) = self.queue.iter().position(|m| m.timestamp() == timestamp) else {
            return false;
        };
        if !self.queue[pos].is_user() {
            return false;
        }
        self.queue.remove(pos);
        true
    }

    pub fn clear_message_queue(&mut self) {
        self.queue.clear();
        self.emit_state();
    }

    /// Replace the whole conversation (admin operation).  The session header
    /// is preserved; entries are rebuilt from the given messages.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.tree.replace_messages(messages);
    }

    // ── Context engineering ───────────────────────────────────────────────────

    /// Queue patch ops for the next request assembly.  Reason requirements
    /// are validated here, synchronously, so a malformed patch never reaches
    /// the turn loop.
    pub fn queue_patches(&mut self, ops: Vec<ContextPatchOp>) -> Result<(), PatchError> {
        for op in &ops {
            op.validate()?;
        }
        self.pending_patches.extend(ops);
        Ok(())
    }

    /// Hot-swap the skill set: rewrite the skills system part, emit the
    /// change, and record a session entry when anything actually changed.
    pub fn reload_skills(&mut self, new_skills: Vec<Skill>, trigger: &str) -> SkillDiff {
        let diff = diff_skills(&self.skills, &new_skills);
        self.skills = new_skills;

        let part = skills_system_part(&self.skills);
        match self
            .system_parts
            .iter_mut()
            .find(|p| p.name == SKILLS_PART)
        {
            Some(existing) => *existing = part.clone(),
            None => self.system_parts.push(part.clone()),
        }
        self.pending_patches.push(ContextPatchOp::SystemPartSet {
            part,
            invalidate_cache_reason: Some(format!("skills changed ({trigger})")),
        });

        self.emit(AgentEvent::SkillsChanged { diff: diff.clone() });
        if !diff.is_empty() {
            let names = |skills: &[Skill]| -> Vec<String> {
                skills.iter().map(|s| s.name.clone()).collect()
            };
            self.tree.append_custom(
                "skills_reload",
                json!({
                    "trigger": trigger,
                    "added": names(&diff.added),
                    "removed": names(&diff.removed),
                    "updated": names(&diff.updated),
                }),
                false,
                None,
            );
        }
        diff
    }

    // ── Prompting ─────────────────────────────────────────────────────────────

    /// Cancel the in-flight stream (and any running tool).  The queue is
    /// preserved; a later `prompt` resumes from the next user message.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Synthesize a user message from text and attachments and process the
    /// queue.  Returns immediately after enqueueing when a turn is already
    /// streaming.
    pub async fn prompt(
        &mut self,
        text: &str,
        attachments: Option<Vec<Attachment>>,
    ) -> anyhow::Result<()> {
        self.prompt_with_cancel(text, attachments, CancellationToken::new())
            .await
    }

    /// Like [`Self::prompt`], with a caller-owned cancellation token so the
    /// host can abort without holding a reference to the agent.
    pub async fn prompt_with_cancel(
        &mut self,
        text: &str,
        attachments: Option<Vec<Attachment>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let message = self.make_user_message(text, attachments);
        self.queue.push_back(message);
        if self.is_streaming {
            self.emit_state();
            return Ok(());
        }
        self.run(cancel).await
    }

    async fn run(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.is_streaming = true;
        self.cancel = cancel;
        self.last_error = None;
        self.emit_state();

        while let Some(user) = self.queue.pop_front() {
            self.turn_index += 1;
            self.emit(AgentEvent::TurnStart);
            self.tree.append_message(user.clone());
            self.emit(AgentEvent::MessageEnd { message: user });

            match self.run_turn().await? {
                TurnOutcome::Completed => {}
                TurnOutcome::Stopped => break,
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }

        self.is_streaming = false;
        self.emit(AgentEvent::AgentEnd);
        self.emit_state();
        Ok(())
    }

    /// One turn: model call, tool dispatch, repeat until a non-tool stop.
    async fn run_turn(&mut self) -> anyhow::Result<TurnOutcome> {
        loop {
            self.request_index += 1;
            let context = self.assemble_context()?;
            let options = StreamOptions {
                tool_choice: None,
                cancel: self.cancel.clone(),
            };
            let mut stream = (self.stream_fn)(self.model.name.clone(), context, options);

            let mut last_snapshot: Option<AssistantMessage> = None;
            while let Some(event) = stream.next().await {
                last_snapshot = Some(event.message().clone());
                self.emit(AgentEvent::MessageUpdate { event });
            }

            match stream.result().await {
                Ok(assistant) => {
                    let message = Message::Assistant(assistant.clone());
                    self.tree.append_message(message.clone());
                    self.emit(AgentEvent::MessageEnd { message });

                    if assistant.stop_reason == StopReason::ToolUse {
                        self.dispatch_tools(&assistant).await;
                        if self.cancel.is_cancelled() {
                            self.emit(AgentEvent::TurnEnd {
                                message: Some(Message::Assistant(assistant)),
                            });
                            return Ok(TurnOutcome::Stopped);
                        }
                        continue;
                    }

                    self.emit(AgentEvent::TurnEnd {
                        message: Some(Message::Assistant(assistant)),
                    });
                    return Ok(TurnOutcome::Completed);
                }
                Err(stream_err) => {
                    // The adapter's final error event carried the errored
                    // snapshot; persist it so repair can drop the pair on
                    // the next submission.
                    let errored = last_snapshot.unwrap_or_else(|| {
                        let mut m = AssistantMessage::empty(
                            "unknown",
                            &self.model.provider,
                            &self.model.name,
                            chrono::Utc::now().timestamp_millis(),
                        );
                        m.stop_reason = StopReason::Error;
                        m.error_message = Some(stream_err.to_string());
                        m
                    });
                    self.last_error = Some(stream_err.to_string());
                    let message = Message::Assistant(errored);
                    self.tree.append_message(message.clone());
                    self.emit(AgentEvent::MessageEnd {
                        message: message.clone(),
                    });
                    self.emit(AgentEvent::TurnEnd {
                        message: Some(message),
                    });
                    self.emit_state();
                    return Ok(TurnOutcome::Stopped);
                }
            }
        }
    }

    /// Execute every tool call of the last assistant message, sequentially
    /// and in content order.
    async fn dispatch_tools(&mut self, assistant: &AssistantMessage) {
        for block in &assistant.content {
            let ContentBlock::ToolCall {
                id,
                name,
                arguments,
                ..
            } = block
            else {
                continue;
            };

            let result = match self.tools.iter().find(|t| t.name() == name) {
                None => {
                    warn!(tool_name = %name, "model called an unregistered tool");
                    Message::tool_result(
                        id.clone(),
                        name.clone(),
                        vec![ToolResultBlock::text(format!("unknown tool: {name}"))],
                        true,
                        chrono::Utc::now().timestamp_millis(),
                    )
                }
                Some(tool) => {
                    let tool = tool.clone();
                    let listeners = self.listeners.clone();
                    let call_id = id.clone();
                    let tool_name = name.clone();
                    let on_update: ToolUpdateFn = Arc::new(move |content| {
                        emit_to(
                            &listeners,
                            &AgentEvent::ToolResultPartial {
                                tool_call_id: call_id.clone(),
                                tool_name: tool_name.clone(),
                                content,
                            },
                        );
                    });

                    let outcome = tool
                        .execute(id, arguments.clone(), self.cancel.child_token(), on_update)
                        .await;
                    let timestamp = chrono::Utc::now().timestamp_millis();
                    if self.cancel.is_cancelled() {
                        Message::tool_result(
                            id.clone(),
                            name.clone(),
                            vec![ToolResultBlock::text("tool interrupted")],
                            true,
                            timestamp,
                        )
                    } else {
                        match outcome {
                            Ok(content) => {
                                Message::tool_result(id.clone(), name.clone(), content, false, timestamp)
                            }
                            Err(e) => Message::tool_result(
                                id.clone(),
                                name.clone(),
                                vec![ToolResultBlock::text(e.to_string())],
                                true,
                                timestamp,
                            ),
                        }
                    }
                }
            };

            self.tree.append_message(result.clone());
            self.emit(AgentEvent::MessageEnd { message: result });
        }
    }

    /// Build the request envelope from the session tree and agent state,
    /// then apply any queued context patches.
    fn assemble_context(&mut self) -> anyhow::Result<Context> {
        let messages = self.tree.build_session_context();
        let tools: Vec<ToolDef> = self
            .tools
            .iter()
            .map(|t| ToolDef {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        let reasoning = match self.thinking_level {
            ThinkingLevel::Off => None,
            level => Some(level),
        };
        let context = Context {
            system: SystemPrompt::new(self.system_parts.clone()),
            tools,
            messages: ContextMessages {
                cached: messages,
                uncached: Vec::new(),
            },
            options: RequestOptions {
                reasoning,
                temperature: self.model.temperature,
                max_tokens: self.model.max_tokens,
            },
            meta: ContextMeta {
                model: self.model.name.clone(),
                limit: catalog::context_window(&self.model.name, 128_000),
                turn_index: self.turn_index,
                request_index: self.request_index,
                tokens: None,
            },
        };

        if self.pending_patches.is_empty() {
            return Ok(context);
        }
        let ops: Vec<ContextPatchOp> = self.pending_patches.drain(..).collect();
        let outcome = apply_patch(&context, &ops)?;
        if outcome.cache_invalidated {
            debug!(
                reasons = ?outcome.invalidate_cache_reasons,
                "context patches invalidated the prompt cache"
            );
        }
        Ok(outcome.context)
    }

    fn make_user_message(&self, text: &str, attachments: Option<Vec<Attachment>>) -> Message {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let Some(attachments) = attachments.filter(|a| !a.is_empty()) else {
            return Message::user(text, timestamp);
        };

        let mut blocks = vec![ContentBlock::text(text)];
        for attachment in &attachments {
            if attachment.mime_type.starts_with("image/") {
                blocks.push(ContentBlock::image(
                    attachment.data.clone(),
                    attachment.mime_type.clone(),
                ));
            } else if let Some(extracted) = &attachment.extracted_text {
                blocks.push(ContentBlock::text(extracted.clone()));
            } else if let Some(transform) = &self.attachment_transformer {
                blocks.extend(transform(attachment));
            } else {
                warn!(
                    file = %attachment.file_name,
                    mime = %attachment.mime_type,
                    "attachment has no extracted text and no transformer; skipped"
                );
            }
        }
        Message::User(UserMessage {
            content: UserContent::Blocks(blocks),
            attachments: Some(attachments),
            timestamp,
        })
    }
}

fn emit_to(listeners: &Listeners, event: &AgentEvent) {
    let guard = listeners.lock().unwrap();
    for listener in guard.iter() {
        if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            warn!("event listener panicked; continuing");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_agent() -> Agent {
        Agent::new(AgentInit {
            model: ModelConfig {
                provider: "mock".into(),
                name: "mock-model".into(),
                ..ModelConfig::default()
            },
            system_parts: vec![SystemPart {
                name: "base".into(),
                text: "You are helpful.".into(),
            }],
            tools: vec![],
            thinking_level: ThinkingLevel::Off,
            session_name: None,
            cwd: "/work".into(),
            stream_fn: None,
            attachment_transformer: None,
        })
        .unwrap()
    }

    fn queued_user(text: &str, timestamp: i64) -> Message {
        Message::User(UserMessage {
            content: UserContent::Blocks(vec![ContentBlock::text(text)]),
            attachments: None,
            timestamp,
        })
    }

    // ── Queue operations (spec scenario: queued edit before send) ─────────────

    #[test]
    fn update_queued_user_message_replaces_content_keeps_timestamp() {
        let mut agent = minimal_agent();
        agent.queue_message(queued_user("a", 1000));
        assert!(agent.update_queued_user_message_by_timestamp(1000, "b"));
        let queue = agent.get_message_queue();
        match &queue[0] {
            Message::User(u) => {
                assert_eq!(u.timestamp, 1000);
                match &u.content {
                    UserContent::Blocks(blocks) => {
                        assert_eq!(blocks, &vec![ContentBlock::text("b")]);
                    }
                    other => panic!("expected blocks, got {other:?}"),
                }
            }
            other => panic!("expected user, got {other:?}"),
        }
    }

    #[test]
    fn update_returns_false_for_unknown_timestamp() {
        let mut agent = minimal_agent();
        agent.queue_message(queued_user("a", 1000));
        assert!(!agent.update_queued_user_message_by_timestamp(2000, "b"));
    }

    /// The first timestamp match decides: a non-user message at the matching
    /// timestamp stops the search even when a user message with the same
    /// timestamp is queued behind it.
    #[test]
    fn update_stops_at_first_timestamp_match_even_if_not_user() {
        let mut agent = minimal_agent();
        agent.queue_message(Message::BashExecution {
            command: "ls".into(),
            output: "".into(),
            exit_code: 0,
            timestamp: 1000,
        });
        agent.queue_message(queued_user("a", 1000));
        assert!(!agent.update_queued_user_message_by_timestamp(1000, "b"));
        // The user message is untouched.
        match &agent.get_message_queue()[1] {
            Message::User(u) => assert_eq!(u.content.as_text(), Some("a")),
            other => panic!("expected user, got {other:?}"),
        }
    }

    #[test]
    fn remove_queued_user_message_by_timestamp_removes_first_match() {
        let mut agent = minimal_agent();
        agent.queue_message(queued_user("a", 1));
        agent.queue_message(queued_user("b", 2));
        assert!(agent.remove_queued_user_message_by_timestamp(1));
        assert_eq!(agent.get_message_queue().len(), 1);
        assert!(!agent.remove_queued_user_message_by_timestamp(1));
    }

    #[test]
    fn clear_message_queue_empties() {
        let mut agent = minimal_agent();
        agent.queue_message(queued_user("a", 1));
        agent.queue_message(queued_user("b", 2));
        agent.clear_message_queue();
        assert!(agent.get_message_queue().is_empty());
    }

    // ── Skills hot-swap ───────────────────────────────────────────────────────

    fn skill(name: &str) -> Skill {
        Skill {
            name: name.into(),
            description: format!("{name} skill"),
            file_path: format!("/skills/{name}.md"),
        }
    }

    #[test]
    fn reload_skills_updates_system_part_and_records_entry() {
        let mut agent = minimal_agent();
        let diff = agent.reload_skills(vec![skill("commit")], "startup");
        assert_eq!(diff.added.len(), 1);
        assert!(agent
            .system_parts
            .iter()
            .any(|p| p.name == SKILLS_PART && p.text.contains("commit")));
        // A skills_reload entry landed in the session.
        let entries = agent.session().entries();
        assert!(entries.iter().any(|e| matches!(
            e,
            crate::session::SessionEntry::CustomMessage { custom_type, .. }
                if custom_type == "skills_reload"
        )));
    }

    #[test]
    fn reload_skills_with_no_change_skips_session_entry() {
        let mut agent = minimal_agent();
        agent.reload_skills(vec![skill("commit")], "startup");
        let before = agent.session().len();
        let diff = agent.reload_skills(vec![skill("commit")], "watcher");
        assert!(diff.is_empty());
        assert_eq!(agent.session().len(), before);
    }

    #[test]
    fn queue_patches_validates_synchronously() {
        let mut agent = minimal_agent();
        let err = agent
            .queue_patches(vec![ContextPatchOp::SystemPartRemove {
                name: "base".into(),
                invalidate_cache_reason: None,
            }])
            .unwrap_err();
        assert!(matches!(err, PatchError::MissingReason { .. }));
    }

    #[test]
    fn listener_panic_is_contained() {
        let mut agent = minimal_agent();
        agent.on(|_| panic!("bad handler"));
        let seen = Arc::new(Mutex::new(0usize));
        let seen2 = seen.clone();
        agent.on(move |_| {
            *seen2.lock().unwrap() += 1;
        });
        agent.queue_message(queued_user("a", 1));
        // The second listener still observed the state update.
        assert!(*seen.lock().unwrap() > 0);
    }
}
