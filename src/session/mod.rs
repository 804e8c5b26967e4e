//! Conversation and session state threaded across turns.
//!
//! A [`SessionState`] owns one [`ConversationContext`] and at most one
//! [`GapRecord`]. Conversation turns are append-only: nothing in this crate
//! rewrites or removes a recorded turn, and context values are only ever
//! inserted or overwritten.

mod gap;
mod handle;

pub use gap::{GapCategory, GapRecord};
pub use handle::SessionHandle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user.
    User,
    /// Any agent in the pipeline, including this one.
    Agent,
    /// Pipeline-injected instructions or handoff notes.
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Agent => write!(f, "agent"),
            Role::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "agent" | "assistant" => Ok(Role::Agent),
            "system" => Ok(Role::System),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// A single recorded utterance. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Speaker.
    pub role: Role,
    /// Utterance text.
    pub text: String,
    /// When the turn was recorded.
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    /// Record a turn now.
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Record a user turn now.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    /// Record an agent turn now.
    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(Role::Agent, text)
    }

    /// Set an explicit timestamp (used when rehydrating from storage).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Ordered turns plus a flat key/value context map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    turns: Vec<ConversationTurn>,
    values: BTreeMap<String, String>,
}

impl ConversationContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a context from stored parts. `turns` must be oldest first.
    pub fn from_parts(turns: Vec<ConversationTurn>, values: BTreeMap<String, String>) -> Self {
        Self { turns, values }
    }

    /// All turns, oldest first.
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// The most recent `limit` turns, oldest first.
    pub fn recent_turns(&self, limit: usize) -> &[ConversationTurn] {
        let start = self.turns.len().saturating_sub(limit);
        &self.turns[start..]
    }

    /// Number of recorded turns.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether no turn has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Append a turn at the end of the history.
    pub fn push_turn(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    /// The flat context map.
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Look up a context value.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Insert or overwrite a context value.
    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

/// Long-lived state threaded across turns of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Unique session identifier.
    pub id: String,
    /// Conversation history and context map.
    pub context: ConversationContext,
    /// Latest gap record, replaced on every completed turn.
    pub gap_record: Option<GapRecord>,
    /// Completed follow-up turns.
    pub turn_count: u64,
    /// The user query anchoring the turn in progress.
    pub current_query: Option<String>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was last updated.
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    /// Start a new session with a random id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Start a new session with a caller-chosen id.
    pub fn with_id(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            context: ConversationContext::new(),
            gap_record: None,
            turn_count: 0,
            current_query: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Seed a context value (user profile, upstream agent hints, ...).
    pub fn with_context_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.set_value(key, value);
        self
    }

    /// Seed a prior turn.
    pub fn with_turn(mut self, turn: ConversationTurn) -> Self {
        self.context.push_turn(turn);
        self
    }

    /// The anchor query, if present and not blank.
    pub fn anchor_query(&self) -> Option<&str> {
        self.current_query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }

    /// Downstream gate: true while the latest gap record asks the user for
    /// more information.
    pub fn awaiting_user_input(&self) -> bool {
        self.gap_record.as_ref().is_some_and(GapRecord::has_gap)
    }

    /// Questions the user has been asked and not yet answered.
    pub fn pending_questions(&self) -> &[String] {
        match &self.gap_record {
            Some(record) => &record.follow_up_questions,
            None => &[],
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
