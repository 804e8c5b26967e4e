use chrono::Utc;

use crate::error::{TurnError, TurnResult};
use crate::session::{ConversationTurn, GapRecord, SessionState};

/// Context key: "true" while the user owes answers to follow-up questions.
pub const PENDING_KEY: &str = "follow_up.pending";
/// Context key: comma-separated missing categories from the latest turn.
pub const MISSING_INFORMATION_KEY: &str = "follow_up.missing_information";

/// Folds a gap record into session state.
///
/// Takes the session by value and returns the next one, so a turn that
/// fails before this point has nothing to roll back.
#[derive(Debug, Clone, Copy, Default)]
pub struct FollowUpStateUpdater;

impl FollowUpStateUpdater {
    /// Create an updater.
    pub fn new() -> Self {
        Self
    }

    /// Record the turn and replace the session's gap record.
    ///
    /// Appends the anchor query as a user turn, then the questions as one
    /// agent turn when there are any. Existing turns are never touched.
    pub fn apply(&self, mut session: SessionState, record: GapRecord) -> TurnResult<SessionState> {
        let query = session
            .anchor_query()
            .map(str::to_owned)
            .ok_or_else(|| TurnError::InvalidState {
                message: format!("Session {} has no user query to record", session.id),
            })?;

        session.context.push_turn(ConversationTurn::user(query));
        if !record.follow_up_questions.is_empty() {
            session
                .context
                .push_turn(ConversationTurn::agent(record.questions_text()));
        }

        session
            .context
            .set_value(PENDING_KEY, record.has_gap().to_string());
        session
            .context
            .set_value(MISSING_INFORMATION_KEY, record.category_labels().join(","));

        session.gap_record = Some(record);
        session.turn_count += 1;
        session.current_query = None;
        session.updated_at = Utc::now();

        Ok(session)
    }
}
