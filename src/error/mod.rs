use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Langbase error: {0}")]
    Langbase(#[from] LangbaseError),

    #[error("Turn failed: {0}")]
    Turn(#[from] TurnError),
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Langbase API errors
#[derive(Debug, Error)]
pub enum LangbaseError {
    #[error("Langbase unavailable: {message}")]
    Unavailable { message: String },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LangbaseError {
    /// Whether retrying the same request may succeed.
    ///
    /// Timeouts, transport failures, rate limiting and server-side errors are
    /// transient. Client errors and unparseable payloads are not.
    pub fn is_transient(&self) -> bool {
        match self {
            LangbaseError::Timeout { .. }
            | LangbaseError::Unavailable { .. }
            | LangbaseError::Http(_) => true,
            LangbaseError::Api { status, .. } => *status == 429 || *status >= 500,
            LangbaseError::InvalidResponse { .. } => false,
        }
    }
}

/// Errors that terminate a single follow-up turn.
///
/// A turn that fails with any of these leaves the session exactly as it was
/// before the turn started.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Invalid session state: {message}")]
    InvalidState { message: String },

    #[error("Upstream unavailable after {attempts} attempt(s): {message}")]
    UpstreamUnavailable { message: String, attempts: u32 },

    #[error("Upstream timed out after {timeout_ms}ms ({attempts} attempt(s))")]
    UpstreamTimeout { timeout_ms: u64, attempts: u32 },

    #[error("Malformed upstream response: {message}")]
    MalformedResponse { message: String },

    #[error("A turn is already in progress for session {session_id}")]
    ConcurrentTurn { session_id: String },

    #[error("Turn cancelled for session {session_id}")]
    Cancelled { session_id: String },
}

impl TurnError {
    /// Whether the caller may retry the whole turn.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TurnError::UpstreamUnavailable { .. }
                | TurnError::UpstreamTimeout { .. }
                | TurnError::MalformedResponse { .. }
                | TurnError::ConcurrentTurn { .. }
        )
    }

    /// Map an exhausted upstream failure onto the turn taxonomy.
    pub fn from_upstream(err: LangbaseError, attempts: u32) -> Self {
        match err {
            LangbaseError::Timeout { timeout_ms } => TurnError::UpstreamTimeout {
                timeout_ms,
                attempts,
            },
            LangbaseError::InvalidResponse { message } => TurnError::MalformedResponse { message },
            other => TurnError::UpstreamUnavailable {
                message: other.to_string(),
                attempts,
            },
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for Langbase operations
pub type LangbaseResult<T> = Result<T, LangbaseError>;

/// Result type alias for turn execution
pub type TurnResult<T> = Result<T, TurnError>;
