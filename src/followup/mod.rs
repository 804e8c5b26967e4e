//! The follow-up turn pipeline.
//!
//! One turn flows through four stages:
//!
//! 1. [`ContextAssembler`] builds the model input from session state.
//! 2. A [`ModelResponder`] produces raw text (one call per attempt).
//! 3. A [`GapExtractor`] turns that text into a [`GapRecord`](crate::session::GapRecord).
//! 4. [`FollowUpStateUpdater`] folds the record into the next session state.
//!
//! [`TurnController`] sequences the stages and owns retries, deadlines and
//! cancellation. [`FollowUpAgent`] adds session lookup and persistence on top.

mod agent;
mod assembler;
mod controller;
mod extractor;
mod responder;
mod updater;

pub use agent::{Agent, AgentReply, FollowUpAgent, NO_FOLLOW_UP_MESSAGE};
pub use assembler::{
    AssembledContext, ContextAssembler, FUND_NAME_KEY, INTENT_KEY, PREVIOUS_QUESTIONS_KEY,
    TIMEFRAME_KEY,
};
pub use controller::{RetryPolicy, TurnController, TurnOutcome, TurnPhase};
pub use extractor::{
    extractor_for, AutoExtractor, GapExtractor, HeuristicExtractor, StructuredExtractor,
};
pub use responder::{LangbaseResponder, ModelRequest, ModelResponder};
pub use updater::{FollowUpStateUpdater, MISSING_INFORMATION_KEY, PENDING_KEY};
