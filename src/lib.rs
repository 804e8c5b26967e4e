//! # Follow-up Agent
//!
//! The follow-up agent of a multi-agent financial assistant. When a user's
//! query cannot be answered as asked, it works out what is missing (which
//! fund, which timeframe, which benchmark, ...) and produces clarifying
//! questions, while keeping conversation state across turns.
//!
//! ## Architecture
//!
//! ```text
//! user query → TurnController → ContextAssembler → ModelResponder (Langbase pipe)
//!                     ↓                                   ↓
//!              FollowUpStateUpdater  ←  GapRecord  ←  GapExtractor
//!                     ↓
//!              SessionStore (SQLite)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use followup_agent::{Config, FollowUpAgent, LangbaseResponder, TurnController};
//! use followup_agent::langbase::LangbaseClient;
//! use followup_agent::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(SqliteStorage::new(&config.database).await?);
//!     let client = LangbaseClient::new(&config.langbase, config.request.clone())?;
//!     let responder = Arc::new(LangbaseResponder::new(client, &config.pipes.follow_up));
//!     let agent = FollowUpAgent::new(TurnController::from_config(&config, responder), store);
//!
//!     let session = agent.open_session("demo").await?;
//!     let reply = agent.run_turn(&session, "How is my fund doing?").await?;
//!     println!("{}", reply.message);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Configuration loaded from the environment.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// The follow-up turn pipeline and agent.
pub mod followup;
/// Langbase API client and types for pipe communication.
pub mod langbase;
/// System prompts for the follow-up pipe.
pub mod prompts;
/// Session, conversation and gap record types.
pub mod session;
/// Session persistence.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult, TurnError, TurnResult};
pub use followup::{
    Agent, AgentReply, FollowUpAgent, LangbaseResponder, ModelResponder, TurnController,
};
pub use session::{GapCategory, GapRecord, SessionHandle, SessionState};
