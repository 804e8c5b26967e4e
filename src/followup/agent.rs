use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::TurnController;
use crate::error::AppResult;
use crate::session::{GapRecord, SessionHandle, SessionState};
use crate::storage::{Invocation, SessionStore};

/// Message returned when the query needs nothing more from the user.
pub const NO_FOLLOW_UP_MESSAGE: &str = "No follow-up needed.";

/// What an agent hands back to the orchestrator after a turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentReply {
    /// Agent that produced the reply.
    pub agent: String,
    /// Session the turn ran against.
    pub session_id: String,
    /// Whether the orchestrator should route back to the user.
    pub needs_user_input: bool,
    /// Text to show the user.
    pub message: String,
    /// Gap details for downstream agents.
    pub gap_record: GapRecord,
}

impl AgentReply {
    fn from_record(agent: &str, session_id: &str, record: GapRecord) -> Self {
        let needs_user_input = record.has_gap();
        let message = if needs_user_input {
            record.questions_text()
        } else {
            NO_FOLLOW_UP_MESSAGE.to_string()
        };
        Self {
            agent: agent.to_string(),
            session_id: session_id.to_string(),
            needs_user_input,
            message,
            gap_record: record,
        }
    }
}

/// Common surface for agents in a routing pipeline.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable agent name used for routing and logs.
    fn name(&self) -> &str;

    /// Handle one user query against a session.
    async fn run_turn(&self, session: &SessionHandle, query: &str) -> AppResult<AgentReply>;
}

/// The follow-up agent: a turn controller plus session persistence.
///
/// Sessions are cached as [`SessionHandle`]s so concurrent callers on the
/// same id share one lock.
pub struct FollowUpAgent {
    controller: TurnController,
    store: Arc<dyn SessionStore>,
    pipe_name: Option<String>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl FollowUpAgent {
    /// Routing name of this agent.
    pub const NAME: &'static str = "follow_up";

    /// Create an agent persisting sessions to `store`.
    pub fn new(controller: TurnController, store: Arc<dyn SessionStore>) -> Self {
        Self {
            controller,
            store,
            pipe_name: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record this pipe name on invocation log entries.
    pub fn with_pipe_name(mut self, pipe_name: impl Into<String>) -> Self {
        self.pipe_name = Some(pipe_name.into());
        self
    }

    /// Handle for `session_id`, loading it from the store or starting fresh.
    pub async fn open_session(&self, session_id: &str) -> AppResult<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(session_id) {
            return Ok(handle.clone());
        }

        let state = match self.store.load_session(session_id).await? {
            Some(state) => {
                info!(session_id, turns = state.context.len(), "Resumed session");
                state
            }
            None => {
                info!(session_id, "Started session");
                SessionState::with_id(session_id)
            }
        };

        let handle = SessionHandle::new(state);
        sessions.insert(session_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Forget a session in memory and in the store.
    ///
    /// Refused with `ConcurrentTurn` while a turn is running, so a turn can
    /// never save the session back after it was deleted. Handles held by
    /// callers are closed.
    pub async fn end_session(&self, session_id: &str) -> AppResult<()> {
        let mut sessions = self.sessions.lock().await;
        let handle = sessions.get(session_id).cloned();
        let turn = handle.as_ref().map(SessionHandle::try_begin_turn).transpose()?;

        self.store.delete_session(session_id).await?;
        if let Some(handle) = &handle {
            handle.close();
        }
        sessions.remove(session_id);
        drop(turn);

        info!(session_id, "Ended session");
        Ok(())
    }

    /// Run a turn that can be abandoned through `cancel`.
    ///
    /// The session is saved only after the turn commits. A failed or
    /// cancelled turn leaves both memory and store unchanged.
    pub async fn run_turn_with_cancel(
        &self,
        handle: &SessionHandle,
        query: &str,
        cancel: CancellationToken,
    ) -> AppResult<AgentReply> {
        let start = Instant::now();
        let mut session = handle.try_begin_turn()?;
        let invocation = self.invocation(handle.id(), query);

        let before = session.clone();
        let outcome = match self.controller.execute(&mut session, query, &cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let failed = invocation.failure(err.to_string(), elapsed_ms(start));
                self.record(&failed).await;
                return Err(err.into());
            }
        };

        if let Err(err) = self.store.save_session(&session).await {
            // Keep memory and store in step.
            *session = before;
            let failed = invocation.failure(err.to_string(), elapsed_ms(start));
            self.record(&failed).await;
            return Err(err.into());
        }

        let reply = AgentReply::from_record(Self::NAME, handle.id(), outcome.gap_record);
        let output = json!({
            "needs_user_input": reply.needs_user_input,
            "missing_information": reply.gap_record.category_labels(),
            "questions": reply.gap_record.follow_up_questions,
            "attempts": outcome.attempts,
        });
        self.record(&invocation.success(output, elapsed_ms(start)))
            .await;

        Ok(reply)
    }

    fn invocation(&self, session_id: &str, query: &str) -> Invocation {
        let invocation = Invocation::new(Self::NAME, json!({ "query": query }))
            .with_session(session_id);
        match &self.pipe_name {
            Some(pipe) => invocation.with_pipe(pipe.as_str()),
            None => invocation,
        }
    }

    async fn record(&self, invocation: &Invocation) {
        if let Err(e) = self.store.log_invocation(invocation).await {
            warn!(error = %e, invocation_id = %invocation.id, "Failed to log invocation");
        }
    }
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

#[async_trait]
impl Agent for FollowUpAgent {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run_turn(&self, session: &SessionHandle, query: &str) -> AppResult<AgentReply> {
        self.run_turn_with_cancel(session, query, CancellationToken::new())
            .await
    }
}
