//! One conversation with the agent.
//!
//! State machine: `Idle -> Streaming -> {AwaitingConfirmation | Idle}`. A
//! streamed model turn may propose actions; only the first one is kept and
//! handed to the [`ConfirmationGate`]. Approved actions run through an
//! [`ActionExecutor`] and their result is fed back as a new model turn until
//! the model answers with text alone.
//!
//! The controller can be driven directly (`submit`, `confirm`, ...) or run as
//! an actor fed by [`SessionCommand`]s, in which case prompts arriving while
//! the session is busy are queued and drained once it is idle again.

use crate::executor::ActionExecutor;
use crate::gate::{Admission, ConfirmationGate, PendingAction};
use crate::queue::{PromptQueue, QueuedPrompt};
use crate::risk::RiskTier;
use futures_util::StreamExt;
use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;
use wa_llm::{
    CompletionProvider, CompletionRequest, LlmError, Message, Part, ProposedAction, Role,
    StreamChunk, ToolDefinition, Usage,
};
use wa_sandbox::{SandboxAction, SandboxError};

pub const DEFAULT_TOOL_LOOPS_MAX: usize = 8;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("provider error: {0}")]
    Provider(#[from] LlmError),

    #[error("session is busy")]
    Busy,

    #[error("no action is awaiting confirmation")]
    NoPendingAction,

    #[error("session is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    AwaitingConfirmation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TextDelta {
        content: String,
    },
    ActionPending {
        action: ProposedAction,
        risk: RiskTier,
    },
    ActionAutoApproved {
        action: ProposedAction,
        risk: RiskTier,
    },
    ActionResult {
        name: String,
        success: bool,
        payload: serde_json::Value,
    },
    ActionCancelled {
        name: String,
    },
    PromptQueued {
        position: usize,
    },
    TurnFinished,
    ProviderFailed {
        message: String,
    },
}

#[derive(Debug)]
pub enum SessionCommand {
    Submit(String),
    Confirm,
    Cancel,
    SetAutoExecute(bool),
    EditQueuedTail(String),
    RemoveQueuedTail,
    ListQueue(oneshot::Sender<Vec<String>>),
    Close,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub system_prompt: String,
    pub auto_execute: bool,
    pub tool_loops_max: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            auto_execute: false,
            tool_loops_max: DEFAULT_TOOL_LOOPS_MAX,
        }
    }
}

#[derive(Clone)]
struct EventSink(mpsc::UnboundedSender<SessionEvent>);

impl EventSink {
    fn emit(&self, event: SessionEvent) {
        if self.0.send(event).is_err() {
            tracing::trace!("session event dropped; no listener");
        }
    }
}

enum AfterAction {
    Continue,
    Stopped,
}

/// Everything a model turn touches. Kept apart from the prompt queue so the
/// actor can queue prompts while a turn holds this mutably.
struct Conversation {
    id: Uuid,
    history: Vec<Message>,
    state: SessionState,
    gate: ConfirmationGate,
    provider: Arc<dyn CompletionProvider>,
    executor: Arc<dyn ActionExecutor>,
    tools: Vec<ToolDefinition>,
    system_prompt: String,
    tool_loops: usize,
    tool_loops_max: usize,
    usage: Usage,
    events: EventSink,
}

impl Conversation {
    #[tracing::instrument(level = "info", skip_all, fields(session_id = %self.id))]
    async fn submit(&mut self, text: String) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(SessionError::Busy);
        }
        tracing::info!(
            prompt_len = text.len(),
            history_messages = self.history.len(),
            "prompt submitted"
        );
        self.history.push(Message::user_text(text));
        self.tool_loops = 0;
        self.run_turns().await
    }

    #[tracing::instrument(level = "info", skip_all, fields(session_id = %self.id))]
    async fn confirm(&mut self) -> Result<()> {
        let Some(pending) = self.gate.confirm() else {
            return Err(SessionError::NoPendingAction);
        };
        tracing::info!(
            action = %pending.action.name,
            risk_tier = %pending.risk,
            waited_ms = (chrono::Utc::now() - pending.created_at).num_milliseconds(),
            "pending action confirmed"
        );
        self.state = SessionState::Streaming;
        match self.execute_pending(pending).await {
            AfterAction::Continue => self.run_turns().await,
            AfterAction::Stopped => Ok(()),
        }
    }

    fn cancel(&mut self) -> Result<()> {
        let Some(pending) = self.gate.cancel() else {
            return Err(SessionError::NoPendingAction);
        };
        let name = pending.action.name;
        tracing::info!(session_id = %self.id, action = %name, "pending action cancelled");
        self.history.push(Message::model_text(format!(
            "Action {name} was cancelled by the user."
        )));
        self.state = SessionState::Idle;
        self.events.emit(SessionEvent::ActionCancelled { name });
        Ok(())
    }

    async fn feed_action_result(
        &mut self,
        call_id: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(SessionError::Busy);
        }
        self.push_action_result(call_id, name, payload);
        self.run_turns().await
    }

    fn set_auto_execute(&mut self, enabled: bool) {
        tracing::info!(session_id = %self.id, auto_execute = enabled, "auto-execute changed");
        self.gate.set_auto_execute(enabled);
    }

    fn push_action_result(&mut self, call_id: &str, name: &str, result: serde_json::Value) {
        self.history.push(Message::new(
            Role::User,
            vec![Part::ActionResult {
                call_id: call_id.to_string(),
                name: name.to_string(),
                result,
            }],
        ));
    }

    fn finish_idle(&mut self) {
        self.state = SessionState::Idle;
        self.events.emit(SessionEvent::TurnFinished);
    }

    async fn run_turns(&mut self) -> Result<()> {
        loop {
            if self.tool_loops >= self.tool_loops_max {
                tracing::warn!(
                    session_id = %self.id,
                    tool_loops_max = self.tool_loops_max,
                    "model turn limit reached"
                );
                self.history.push(Message::model_text(format!(
                    "Stopped after {} model turns in a row. Send a message to continue.",
                    self.tool_loops_max
                )));
                self.finish_idle();
                return Ok(());
            }
            self.tool_loops += 1;
            self.state = SessionState::Streaming;

            let (message, action) = match self.stream_turn().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(session_id = %self.id, error = %e, "provider turn failed");
                    self.state = SessionState::Idle;
                    self.events.emit(SessionEvent::ProviderFailed {
                        message: e.to_string(),
                    });
                    return Err(SessionError::Provider(e));
                }
            };
            self.history.push(message);

            let Some(action) = action else {
                self.finish_idle();
                return Ok(());
            };
            match self.gate.propose(action.clone()) {
                Admission::Suspended(risk) => {
                    self.state = SessionState::AwaitingConfirmation;
                    self.events
                        .emit(SessionEvent::ActionPending { action, risk });
                    return Ok(());
                }
                Admission::AutoApproved(pending) => {
                    self.events.emit(SessionEvent::ActionAutoApproved {
                        action,
                        risk: pending.risk,
                    });
                    match self.execute_pending(pending).await {
                        AfterAction::Continue => continue,
                        AfterAction::Stopped => return Ok(()),
                    }
                }
                Admission::Ignored => {
                    self.state = SessionState::AwaitingConfirmation;
                    return Ok(());
                }
            }
        }
    }

    /// Streams one model turn. Returns the finished model message and the
    /// first proposed action, if any; later actions in the same turn are
    /// discarded and never recorded.
    async fn stream_turn(
        &mut self,
    ) -> std::result::Result<(Message, Option<ProposedAction>), LlmError> {
        let request = CompletionRequest {
            system_prompt: self.system_prompt.clone(),
            messages: self.history.clone(),
            tools: self.tools.clone(),
        };
        let started = Instant::now();
        let mut stream = self.provider.stream(&request).await?;

        let mut text = String::new();
        let mut calls: Vec<(String, String, String)> = Vec::new();
        let mut delta_chunks = 0usize;
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Delta { content } => {
                    delta_chunks = delta_chunks.saturating_add(1);
                    text.push_str(&content);
                    self.events.emit(SessionEvent::TextDelta { content });
                }
                StreamChunk::ToolCallStart { id, name } => {
                    tracing::debug!(tool_call_id = %id, action = %name, "model proposed action");
                    calls.push((id, name, String::new()));
                }
                StreamChunk::ToolCallDelta { arguments } => {
                    if let Some(last) = calls.last_mut() {
                        last.2.push_str(&arguments);
                    }
                }
                StreamChunk::Done { usage } => {
                    self.usage.prompt_tokens =
                        self.usage.prompt_tokens.saturating_add(usage.prompt_tokens);
                    self.usage.completion_tokens = self
                        .usage
                        .completion_tokens
                        .saturating_add(usage.completion_tokens);
                }
            }
        }

        let proposed = calls.len();
        let action = match calls.into_iter().next() {
            Some((id, name, arguments)) => Some(proposed_action(id, name, &arguments)?),
            None => None,
        };
        if proposed > 1 {
            tracing::warn!(
                session_id = %self.id,
                discarded = proposed - 1,
                "extra actions in one turn discarded"
            );
        }
        tracing::info!(
            session_id = %self.id,
            model = %self.provider.model(),
            tool_loop = self.tool_loops,
            latency_ms = started.elapsed().as_millis() as u64,
            delta_chunks,
            text_len = text.len(),
            proposed_actions = proposed,
            total_prompt_tokens = self.usage.prompt_tokens,
            total_completion_tokens = self.usage.completion_tokens,
            "model turn finished"
        );

        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(Part::Text { text });
        }
        if let Some(action) = &action {
            parts.push(Part::ProposedAction(action.clone()));
        }
        Ok((Message::new(Role::Model, parts), action))
    }

    /// Runs an approved action. Validation failures go back to the model so
    /// it can correct itself; execution failures end the turn.
    async fn execute_pending(&mut self, pending: PendingAction) -> AfterAction {
        let PendingAction {
            action: proposed,
            risk,
            ..
        } = pending;
        let started = Instant::now();
        let outcome = match SandboxAction::parse(&proposed.name, proposed.args.clone()) {
            Ok(action) => self.executor.execute(&action).await,
            Err(e) => Err(e),
        };
        tracing::info!(
            session_id = %self.id,
            action = %proposed.name,
            risk_tier = %risk,
            success = outcome.is_ok(),
            latency_ms = started.elapsed().as_millis() as u64,
            "action executed"
        );

        match outcome {
            Ok(data) => {
                self.events.emit(SessionEvent::ActionResult {
                    name: proposed.name.clone(),
                    success: true,
                    payload: data.clone(),
                });
                self.push_action_result(&proposed.id, &proposed.name, data);
                AfterAction::Continue
            }
            Err(e @ SandboxError::Validation(_)) => {
                let payload = json!({ "error": e.message(), "error_code": e.code() });
                self.events.emit(SessionEvent::ActionResult {
                    name: proposed.name.clone(),
                    success: false,
                    payload: payload.clone(),
                });
                self.push_action_result(&proposed.id, &proposed.name, payload);
                AfterAction::Continue
            }
            Err(e @ SandboxError::Execution(_)) => {
                let payload = json!({ "error": e.message(), "error_code": e.code() });
                self.events.emit(SessionEvent::ActionResult {
                    name: proposed.name.clone(),
                    success: false,
                    payload: payload.clone(),
                });
                self.push_action_result(&proposed.id, &proposed.name, payload);
                self.history.push(Message::model_text(format!(
                    "Action {} failed: {}",
                    proposed.name,
                    e.message()
                )));
                self.finish_idle();
                AfterAction::Stopped
            }
        }
    }
}

fn proposed_action(
    id: String,
    name: String,
    arguments: &str,
) -> std::result::Result<ProposedAction, LlmError> {
    let args = if arguments.trim().is_empty() {
        serde_json::Map::new()
    } else {
        match serde_json::from_str::<serde_json::Value>(arguments) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => {
                return Err(LlmError::ResponseFormat(format!(
                    "arguments for {name} are not a JSON object"
                )));
            }
            Err(e) => {
                return Err(LlmError::ResponseFormat(format!(
                    "arguments for {name} are not valid JSON: {e}"
                )));
            }
        }
    };
    let id = if id.is_empty() {
        format!("call_{}", Uuid::new_v4().simple())
    } else {
        id
    };
    Ok(ProposedAction { id, name, args })
}

pub struct SessionController {
    conv: Conversation,
    queue: PromptQueue,
    events: EventSink,
}

impl SessionController {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        executor: Arc<dyn ActionExecutor>,
        tools: Vec<ToolDefinition>,
        settings: SessionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventSink(tx);
        let conv = Conversation {
            id: Uuid::new_v4(),
            history: Vec::new(),
            state: SessionState::Idle,
            gate: ConfirmationGate::new(settings.auto_execute),
            provider,
            executor,
            tools,
            system_prompt: settings.system_prompt,
            tool_loops: 0,
            tool_loops_max: settings.tool_loops_max.max(1),
            usage: Usage::default(),
            events: events.clone(),
        };
        tracing::info!(
            session_id = %conv.id,
            executor = %conv.executor.describe(),
            auto_execute = settings.auto_execute,
            tools = conv.tools.len(),
            "session created"
        );
        (
            Self {
                conv,
                queue: PromptQueue::new(),
                events,
            },
            rx,
        )
    }

    pub fn state(&self) -> SessionState {
        self.conv.state
    }

    pub fn history(&self) -> &[Message] {
        &self.conv.history
    }

    pub fn pending(&self) -> Option<&PendingAction> {
        self.conv.gate.pending()
    }

    pub fn auto_execute(&self) -> bool {
        self.conv.gate.auto_execute()
    }

    pub fn usage(&self) -> &Usage {
        &self.conv.usage
    }

    pub fn queued(&self) -> Vec<String> {
        self.queue.texts()
    }

    /// Appends a user prompt and runs model turns until the session is idle
    /// or an action awaits confirmation.
    pub async fn submit(&mut self, text: impl Into<String>) -> Result<()> {
        self.conv.submit(text.into()).await
    }

    pub async fn confirm(&mut self) -> Result<()> {
        self.conv.confirm().await
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.conv.cancel()
    }

    /// Feeds a result for `call_id` back to the model as a function response
    /// and resumes the conversation.
    pub async fn feed_action_result(
        &mut self,
        call_id: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.conv.feed_action_result(call_id, name, payload).await
    }

    pub fn set_auto_execute(&mut self, enabled: bool) {
        self.conv.set_auto_execute(enabled);
    }

    pub fn queue_prompt(&mut self, text: impl Into<String>) -> usize {
        let position = self.queue.push(text);
        self.events.emit(SessionEvent::PromptQueued { position });
        position
    }

    pub fn edit_queued_tail(&mut self, text: impl Into<String>) -> bool {
        self.queue.edit_tail(text)
    }

    pub fn take_queued_tail(&mut self) -> Option<QueuedPrompt> {
        self.queue.take_tail()
    }

    /// Submits queued prompts in arrival order while the session stays idle.
    /// A provider failure consumes its prompt and draining moves on.
    pub async fn drain_queue(&mut self) -> usize {
        let mut submitted = 0usize;
        while self.conv.state == SessionState::Idle {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            submitted += 1;
            if let Err(e) = self.conv.submit(next.text).await {
                tracing::warn!(session_id = %self.conv.id, seq = next.seq, error = %e, "queued prompt failed");
            }
        }
        submitted
    }

    pub fn spawn(self) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(self.run(rx));
        (SessionHandle { commands: tx }, handle)
    }

    /// Actor loop. Returns when `Close` arrives or every sender is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let mut deferred: VecDeque<SessionCommand> = VecDeque::new();
        tracing::info!(
            session_id = %self.conv.id,
            auto_execute = self.auto_execute(),
            "session actor started"
        );
        loop {
            let command = match deferred.pop_front() {
                Some(c) => c,
                None => match commands.recv().await {
                    Some(c) => c,
                    None => break,
                },
            };

            let result = match command {
                SessionCommand::Submit(text) if self.state() == SessionState::Idle => {
                    self.busy(Turn::Submit(text), &mut commands, &mut deferred)
                        .await
                }
                SessionCommand::Submit(text) => {
                    self.queue_prompt(text);
                    Ok(())
                }
                SessionCommand::Confirm => {
                    self.busy(Turn::Confirm, &mut commands, &mut deferred).await
                }
                SessionCommand::Cancel => self.cancel(),
                SessionCommand::SetAutoExecute(enabled) => {
                    self.set_auto_execute(enabled);
                    Ok(())
                }
                SessionCommand::EditQueuedTail(text) => {
                    if !self.edit_queued_tail(text) {
                        tracing::debug!("no queued prompt to edit");
                    }
                    Ok(())
                }
                SessionCommand::RemoveQueuedTail => {
                    if self.take_queued_tail().is_none() {
                        tracing::debug!("no queued prompt to remove");
                    }
                    Ok(())
                }
                SessionCommand::ListQueue(reply) => {
                    let _ = reply.send(self.queued());
                    Ok(())
                }
                SessionCommand::Close => break,
            };
            if let Err(e) = result {
                tracing::warn!(session_id = %self.conv.id, error = %e, "session command failed");
            }

            // Commands held back during a turn run before queued prompts.
            while deferred.is_empty() && self.state() == SessionState::Idle {
                let Some(next) = self.queue.pop_front() else {
                    break;
                };
                tracing::info!(session_id = %self.conv.id, seq = next.seq, "submitting queued prompt");
                if let Err(e) = self
                    .busy(Turn::Submit(next.text), &mut commands, &mut deferred)
                    .await
                {
                    tracing::warn!(session_id = %self.conv.id, error = %e, "queued prompt failed");
                }
            }
        }
        let usage = self.usage();
        tracing::info!(
            session_id = %self.conv.id,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "session actor stopped"
        );
    }

    async fn busy(
        &mut self,
        turn: Turn,
        commands: &mut mpsc::Receiver<SessionCommand>,
        deferred: &mut VecDeque<SessionCommand>,
    ) -> Result<()> {
        let Self {
            conv,
            queue,
            events,
        } = self;
        match turn {
            Turn::Submit(text) => {
                while_busy(conv.submit(text), commands, queue, deferred, events).await
            }
            Turn::Confirm => while_busy(conv.confirm(), commands, queue, deferred, events).await,
        }
    }
}

enum Turn {
    Submit(String),
    Confirm,
}

/// Drives `turn` to completion while still accepting commands. Prompts are
/// queued, queue edits apply immediately, confirm/cancel are refused (nothing
/// can be pending mid-turn) and everything else waits for the turn to end.
async fn while_busy<F>(
    turn: F,
    commands: &mut mpsc::Receiver<SessionCommand>,
    queue: &mut PromptQueue,
    deferred: &mut VecDeque<SessionCommand>,
    events: &EventSink,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::pin!(turn);
    let mut open = true;
    loop {
        tokio::select! {
            result = &mut turn => return result,
            command = commands.recv(), if open => match command {
                Some(SessionCommand::Submit(text)) => {
                    let position = queue.push(text);
                    events.emit(SessionEvent::PromptQueued { position });
                }
                Some(SessionCommand::EditQueuedTail(text)) => {
                    queue.edit_tail(text);
                }
                Some(SessionCommand::RemoveQueuedTail) => {
                    queue.take_tail();
                }
                Some(SessionCommand::ListQueue(reply)) => {
                    let _ = reply.send(queue.texts());
                }
                Some(SessionCommand::Confirm | SessionCommand::Cancel) => {
                    tracing::warn!("confirm/cancel ignored while a turn is running");
                }
                Some(other) => deferred.push_back(other),
                None => open = false,
            },
        }
    }
}

/// Cloneable sender side of a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub async fn queued(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::ListQueue(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}
