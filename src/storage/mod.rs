//! Session persistence.
//!
//! The turn controller keeps working state in memory; a [`SessionStore`]
//! makes it survive process restarts. Conversation turns are stored
//! append-only: saving a session only ever adds the turns the store has not
//! seen yet.

mod memory;
mod sqlite;


pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::session::SessionState;

/// Log entry for one agent turn, kept for debugging and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Unique invocation identifier.
    pub id: String,
    /// Session the turn ran against.
    pub session_id: Option<String>,
    /// Name of the agent that handled the turn.
    pub agent: String,
    /// Input as JSON.
    pub input: serde_json::Value,
    /// Output as JSON (if successful).
    pub output: Option<serde_json::Value>,
    /// Name of the Langbase pipe called.
    pub pipe_name: Option<String>,
    /// Latency in milliseconds.
    pub latency_ms: Option<i64>,
    /// Whether the turn succeeded.
    pub success: bool,
    /// Error message (if failed).
    pub error: Option<String>,
    /// When the invocation occurred.
    pub created_at: DateTime<Utc>,
}

impl Invocation {
    /// Create a new invocation log entry
    pub fn new(agent: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: None,
            agent: agent.into(),
            input,
            output: None,
            pipe_name: None,
            latency_ms: None,
            success: true,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Set the session ID
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the pipe name
    pub fn with_pipe(mut self, pipe_name: impl Into<String>) -> Self {
        self.pipe_name = Some(pipe_name.into());
        self
    }

    /// Mark as successful with output
    pub fn success(mut self, output: serde_json::Value, latency_ms: i64) -> Self {
        self.success = true;
        self.output = Some(output);
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Mark as failed with error
    pub fn failure(mut self, error: impl Into<String>, latency_ms: i64) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Persistence for follow-up sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session with its full history, oldest turn first.
    async fn load_session(&self, id: &str) -> StorageResult<Option<SessionState>>;

    /// Insert or update a session.
    ///
    /// Appends turns beyond those already stored. Fails if the session's
    /// history is shorter than what is stored, since turns are never removed.
    async fn save_session(&self, session: &SessionState) -> StorageResult<()>;

    /// Delete a session and its turns. Deleting an unknown id is not an error.
    async fn delete_session(&self, id: &str) -> StorageResult<()>;

    /// Record an invocation log entry.
    async fn log_invocation(&self, invocation: &Invocation) -> StorageResult<()>;

    /// Invocations for a session, oldest first.
    async fn session_invocations(&self, session_id: &str) -> StorageResult<Vec<Invocation>>;
}
