//! # Conversation Orchestrator
//!
//! Turns one user message into a persisted transcript turn, an agent
//! invocation and a stream of wire events for the client.
//!
//! At most one turn streams per project. The reservation is taken with a
//! single `entry()` call on the active map and released by an
//! [`ActiveGuard`] on every exit path, so a failed or abandoned turn can
//! never leave a project marked as streaming.
//!
//! Each turn is driven by an explicit [`TurnState`] machine:
//!
//! ```text
//! Idle -> Streaming { buffer, tool_log } -> Completed
//!                                        -> Errored
//! ```

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentRunner, ChatMode, EventStream, InvokeRequest};
use crate::config::HISTORY_TURNS;
use crate::error::{ChatError, StoreError};
use crate::prompts;
use crate::protocol::{AgentEvent, AskUserQuestion, ASK_USER_QUESTION_TOOL};
use crate::store::{Project, ProjectStore, Role, ToolActivity, TurnMetadata};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEventKind {
    UserMessage,
    Text,
    ToolUse,
    ToolResult,
    AskUserQuestion,
    Complete,
    Error,
}

/// One event as delivered to the client over SSE.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(rename = "type")]
    pub kind: ChatEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolActivity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_user_question: Option<AskUserQuestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl ChatEvent {
    fn new(kind: ChatEventKind) -> Self {
        Self {
            kind,
            content: None,
            tool: None,
            ask_user_question: None,
            error: None,
            session_id: None,
            cost: None,
            message_id: None,
        }
    }

    pub fn user_message(message_id: String) -> Self {
        Self {
            message_id: Some(message_id),
            ..Self::new(ChatEventKind::UserMessage)
        }
    }

    pub fn text(content: String) -> Self {
        Self {
            content: Some(content),
            ..Self::new(ChatEventKind::Text)
        }
    }

    pub fn tool_use(tool: ToolActivity) -> Self {
        Self {
            tool: Some(tool),
            ..Self::new(ChatEventKind::ToolUse)
        }
    }

    pub fn tool_result(content: String) -> Self {
        Self {
            content: Some(content),
            ..Self::new(ChatEventKind::ToolResult)
        }
    }

    pub fn ask_user_question(question: AskUserQuestion) -> Self {
        Self {
            ask_user_question: Some(question),
            ..Self::new(ChatEventKind::AskUserQuestion)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(ChatEventKind::Error)
        }
    }

    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self.kind {
            ChatEventKind::UserMessage => "user_message",
            ChatEventKind::Text => "text",
            ChatEventKind::ToolUse => "tool_use",
            ChatEventKind::ToolResult => "tool_result",
            ChatEventKind::AskUserQuestion => "ask_user_question",
            ChatEventKind::Complete => "complete",
            ChatEventKind::Error => "error",
        }
    }
}

/// Snapshot of the turn currently streaming for a project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveConversation {
    pub project_id: String,
    pub session_id: String,
    pub is_streaming: bool,
    pub current_tool: Option<ToolActivity>,
    pub accumulated_text: String,
    pub started_at: DateTime<Utc>,
}

/// What a streaming turn has gathered so far.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TurnProgress {
    pub buffer: String,
    pub tool_log: Vec<ToolActivity>,
    pub current_tool: Option<ToolActivity>,
    pub resume_token: Option<String>,
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnState {
    Idle,
    Streaming(TurnProgress),
    Completed(TurnProgress),
    Errored(String),
}

impl TurnState {
    /// Apply one agent event. Returns the next state and the wire event to
    /// forward, if any. Terminal states ignore further input.
    pub fn advance(self, event: AgentEvent) -> (TurnState, Option<ChatEvent>) {
        let mut progress = match self {
            TurnState::Idle => TurnProgress::default(),
            TurnState::Streaming(progress) => progress,
            done @ (TurnState::Completed(_) | TurnState::Errored(_)) => {
                debug!("Ignoring {:?} after turn ended", event);
                return (done, None);
            }
        };

        match event {
            AgentEvent::Init { resume_token } => {
                progress.resume_token = Some(resume_token);
                (TurnState::Streaming(progress), None)
            }
            AgentEvent::Text { content } => {
                progress.buffer.push_str(&content);
                (TurnState::Streaming(progress), Some(ChatEvent::text(content)))
            }
            AgentEvent::ToolUse { name, input } => {
                let tool = ToolActivity { name, input };
                progress.tool_log.push(tool.clone());
                progress.current_tool = Some(tool.clone());
                (TurnState::Streaming(progress), Some(ChatEvent::tool_use(tool)))
            }
            AgentEvent::ToolResult { content, .. } => {
                progress.current_tool = None;
                (TurnState::Streaming(progress), Some(ChatEvent::tool_result(content)))
            }
            AgentEvent::AskUserQuestion(question) => {
                progress.tool_log.push(ToolActivity {
                    name: ASK_USER_QUESTION_TOOL.to_string(),
                    input: serde_json::to_value(&question).unwrap_or_default(),
                });
                (
                    TurnState::Streaming(progress),
                    Some(ChatEvent::ask_user_question(question)),
                )
            }
            AgentEvent::Complete { cost } => {
                progress.cost = cost;
                progress.current_tool = None;
                (TurnState::Completed(progress), None)
            }
            AgentEvent::Error { message } => {
                let forward = ChatEvent::error(message.clone());
                (TurnState::Errored(message), Some(forward))
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Completed(_) | TurnState::Errored(_))
    }
}

/// Removes the project's active entry when dropped.
struct ActiveGuard {
    active: Arc<DashMap<String, ActiveConversation>>,
    project_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.active.remove(&self.project_id).is_some() {
            debug!("Released active conversation for {}", self.project_id);
        }
    }
}

pub struct ChatService {
    agent: Arc<dyn AgentRunner>,
    store: Arc<dyn ProjectStore>,
    active: Arc<DashMap<String, ActiveConversation>>,
}

impl ChatService {
    pub fn new(agent: Arc<dyn AgentRunner>, store: Arc<dyn ProjectStore>) -> Self {
        Self {
            agent,
            store,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Start a turn. The returned channel yields `user_message` first and
    /// ends with either `complete` or `error`.
    ///
    /// Fails without persisting anything if the project is unknown or
    /// already streaming. Anything that goes wrong after that, including a
    /// failed agent launch, arrives as an `error` event on the channel.
    pub async fn send_message(
        &self,
        project_id: &str,
        content: &str,
        mode: ChatMode,
    ) -> Result<mpsc::Receiver<ChatEvent>, ChatError> {
        let project = self.store.find_project(project_id).map_err(not_found)?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let guard = self.reserve(project_id, &session_id)?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        match self.begin_turn(&project, content, mode, &session_id, &tx).await {
            Ok(stream) => {
                let driver = TurnDriver {
                    store: self.store.clone(),
                    active: self.active.clone(),
                    project_id: project_id.to_string(),
                    session_id,
                    prior_token: project.resume_token,
                };
                tokio::spawn(driver.run(stream, guard, tx));
            }
            Err(e) => {
                error!("Chat turn {} for {} failed to start: {}", session_id, project_id, e);
                drop(guard);
                let _ = tx.try_send(ChatEvent::error(e.to_string()));
            }
        }
        Ok(rx)
    }

    /// Persist the user turn, announce it and launch the agent.
    async fn begin_turn(
        &self,
        project: &Project,
        content: &str,
        mode: ChatMode,
        session_id: &str,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<EventStream, ChatError> {
        // History is replayed only into a fresh external session, and must
        // be read before the new user turn lands.
        let history = match project.resume_token {
            None => Some(self.store.recent_turns(&project.id, HISTORY_TURNS)?),
            Some(_) => None,
        };
        let user_turn = self
            .store
            .append_turn(&project.id, Role::User, content, TurnMetadata::default())?;
        // Fresh channel, cannot be full
        let _ = tx.try_send(ChatEvent::user_message(user_turn.id));
        let prompt = prompts::build_prompt(project, mode, history.as_deref(), content);

        info!(
            "Chat turn {} for {} ({:?}, resume: {})",
            session_id,
            project.id,
            mode,
            project.resume_token.is_some()
        );
        let stream = self
            .agent
            .invoke(InvokeRequest {
                project_dir: project.path.clone(),
                prompt,
                session_id: session_id.to_string(),
                resume_token: project.resume_token.clone(),
                mode,
            })
            .await?;
        Ok(stream)
    }

    /// Cancel the streaming turn for a project, if any.
    pub fn stop(&self, project_id: &str) -> bool {
        let session_id = match self.active.get(project_id) {
            Some(active) => active.session_id.clone(),
            None => return false,
        };
        self.agent.cancel(&session_id)
    }

    pub fn active(&self, project_id: &str) -> Option<ActiveConversation> {
        self.active.get(project_id).map(|a| a.value().clone())
    }

    /// Forget the external session so the next turn starts fresh and
    /// replays history.
    pub fn reset_session(&self, project_id: &str) -> Result<(), ChatError> {
        self.store.update_resume_token(project_id, None).map_err(not_found)?;
        info!("Reset agent session for {}", project_id);
        Ok(())
    }

    fn reserve(&self, project_id: &str, session_id: &str) -> Result<ActiveGuard, ChatError> {
        match self.active.entry(project_id.to_string()) {
            Entry::Occupied(_) => {
                warn!("Rejected concurrent chat turn for {}", project_id);
                Err(ChatError::ConcurrentStreamRejected(project_id.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveConversation {
                    project_id: project_id.to_string(),
                    session_id: session_id.to_string(),
                    is_streaming: true,
                    current_tool: None,
                    accumulated_text: String::new(),
                    started_at: Utc::now(),
                });
                Ok(ActiveGuard {
                    active: self.active.clone(),
                    project_id: project_id.to_string(),
                })
            }
        }
    }
}

fn not_found(err: StoreError) -> ChatError {
    match err {
        StoreError::NotFound(id) => ChatError::ProjectNotFound(id),
        other => ChatError::Store(other),
    }
}

/// Task-side half of one turn.
struct TurnDriver {
    store: Arc<dyn ProjectStore>,
    active: Arc<DashMap<String, ActiveConversation>>,
    project_id: String,
    session_id: String,
    prior_token: Option<String>,
}

impl TurnDriver {
    async fn run(self, mut stream: EventStream, guard: ActiveGuard, tx: mpsc::Sender<ChatEvent>) {
        let mut state = TurnState::Idle;
        let mut client_gone = false;

        // Drain to the end even after a terminal state so the agent
        // process is always reaped.
        while let Some(event) = stream.next().await {
            let (next, forward) = state.advance(event);
            state = next;
            self.mirror(&state);

            if let Some(event) = forward {
                if !client_gone && tx.send(event).await.is_err() {
                    // Keep going; the response is still persisted.
                    debug!("Client left turn {}, continuing without forwarding", self.session_id);
                    client_gone = true;
                }
            }
        }

        let final_event = match state {
            TurnState::Errored(message) => {
                warn!("Chat turn {} failed: {}", self.session_id, message);
                None
            }
            TurnState::Idle => Some(self.complete(TurnProgress::default())),
            TurnState::Streaming(progress) | TurnState::Completed(progress) => Some(self.complete(progress)),
        };

        // Release before the final event so the client may send again as
        // soon as it sees it.
        drop(guard);
        if let Some(event) = final_event {
            let _ = tx.send(event).await;
        }
    }

    /// Reflect the turn state into the shared active snapshot.
    fn mirror(&self, state: &TurnState) {
        let Some(mut active) = self.active.get_mut(&self.project_id) else {
            return;
        };
        if state.is_terminal() {
            active.is_streaming = false;
            active.current_tool = None;
        } else if let TurnState::Streaming(progress) = state {
            active.accumulated_text.clone_from(&progress.buffer);
            active.current_tool.clone_from(&progress.current_tool);
        }
    }

    fn complete(&self, progress: TurnProgress) -> ChatEvent {
        let cost = progress.cost;
        let session_id = progress.resume_token.clone().or_else(|| self.prior_token.clone());
        match self.persist(progress) {
            Ok(message_id) => {
                info!(
                    "Chat turn {} completed (assistant turn: {:?}, cost: {:?})",
                    self.session_id, message_id, cost
                );
                ChatEvent {
                    message_id,
                    session_id,
                    cost,
                    ..ChatEvent::new(ChatEventKind::Complete)
                }
            }
            Err(e) => {
                error!("Failed to save chat turn {}: {}", self.session_id, e);
                ChatEvent::error(format!("Failed to save assistant response: {}", e))
            }
        }
    }

    /// Store the resume token and the assistant turn. An empty response
    /// produces no turn.
    fn persist(&self, progress: TurnProgress) -> Result<Option<String>, StoreError> {
        if let Some(token) = progress.resume_token.as_deref() {
            if self.prior_token.as_deref() != Some(token) {
                self.store.update_resume_token(&self.project_id, Some(token))?;
            }
        }
        if progress.buffer.is_empty() && progress.tool_log.is_empty() {
            return Ok(None);
        }
        let turn = self.store.append_turn(
            &self.project_id,
            Role::Assistant,
            &progress.buffer,
            TurnMetadata {
                tool_activity: progress.tool_log,
                cost: progress.cost,
            },
        )?;
        Ok(Some(turn.id))
    }
}
