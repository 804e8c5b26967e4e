use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::extractor::{drop_repeated_questions, normalize};
use super::{
    extractor_for, ContextAssembler, FollowUpStateUpdater, GapExtractor, ModelRequest,
    ModelResponder,
};
use crate::config::{Config, RequestConfig};
use crate::error::{LangbaseError, TurnError, TurnResult};
use crate::prompts::system_prompt_for;
use crate::session::{GapRecord, Role, SessionHandle, SessionState};

/// Phase of a single follow-up turn.
///
/// `Idle → Assembling → AwaitingModel → Extracting → Updated → Idle`, with
/// any non-terminal phase allowed to drop into `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// No turn in progress.
    Idle,
    /// Building model input from session state.
    Assembling,
    /// Waiting on the model.
    AwaitingModel,
    /// Parsing the model output.
    Extracting,
    /// The new state has been committed.
    Updated,
    /// The turn ended without changing the session.
    Failed,
}

impl TurnPhase {
    /// Whether `next` may follow `self`.
    pub fn can_transition_to(self, next: TurnPhase) -> bool {
        use TurnPhase::*;
        matches!(
            (self, next),
            (Idle, Assembling)
                | (Assembling, AwaitingModel)
                | (AwaitingModel, Extracting)
                | (Extracting, Updated)
                | (Updated, Idle)
                | (Idle | Assembling | AwaitingModel | Extracting, Failed)
        )
    }
}

impl std::fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TurnPhase::Idle => "idle",
            TurnPhase::Assembling => "assembling",
            TurnPhase::AwaitingModel => "awaiting_model",
            TurnPhase::Extracting => "extracting",
            TurnPhase::Updated => "updated",
            TurnPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct PhaseTracker {
    session_id: String,
    current: TurnPhase,
    trail: Vec<TurnPhase>,
}

impl PhaseTracker {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            current: TurnPhase::Idle,
            trail: vec![TurnPhase::Idle],
        }
    }

    fn advance(&mut self, next: TurnPhase) {
        debug_assert!(
            self.current.can_transition_to(next),
            "illegal turn transition {} -> {}",
            self.current,
            next
        );
        debug!(
            session_id = %self.session_id,
            from = %self.current,
            to = %next,
            "Turn phase transition"
        );
        self.current = next;
        self.trail.push(next);
    }
}

/// Bounded retry with exponential backoff and a per-attempt deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles on each further retry.
    pub base_delay: Duration,
    /// Deadline for a single model call.
    pub deadline: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl From<&RequestConfig> for RetryPolicy {
    fn from(config: &RequestConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            deadline: config.deadline(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RequestConfig::default())
    }
}

/// Result of a completed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    /// Session the turn ran against.
    pub session_id: String,
    /// Record committed by the turn.
    pub gap_record: GapRecord,
    /// Model calls made, including the successful one.
    pub attempts: u32,
    /// Wall-clock duration of the turn.
    pub latency_ms: u64,
    /// Phases visited, starting and ending at `idle`.
    pub phases: Vec<TurnPhase>,
}

/// Sequences one follow-up turn: assemble, call the model, extract, update.
///
/// A turn either commits a complete new state or leaves the session
/// untouched. Work happens on a clone of the session that replaces the
/// original only after the updater succeeds.
pub struct TurnController {
    assembler: ContextAssembler,
    responder: Arc<dyn ModelResponder>,
    extractor: Arc<dyn GapExtractor>,
    updater: FollowUpStateUpdater,
    retry: RetryPolicy,
    system_instructions: String,
}

impl TurnController {
    /// Create a controller from its parts.
    pub fn new(
        responder: Arc<dyn ModelResponder>,
        extractor: Arc<dyn GapExtractor>,
        assembler: ContextAssembler,
        retry: RetryPolicy,
        system_instructions: impl Into<String>,
    ) -> Self {
        Self {
            assembler,
            responder,
            extractor,
            updater: FollowUpStateUpdater::new(),
            retry,
            system_instructions: system_instructions.into(),
        }
    }

    /// Wire a controller from configuration.
    pub fn from_config(config: &Config, responder: Arc<dyn ModelResponder>) -> Self {
        let strategy = config.follow_up.extraction;
        Self::new(
            responder,
            extractor_for(strategy, config.follow_up.max_questions),
            ContextAssembler::new(config.follow_up.max_history_turns),
            RetryPolicy::from(&config.request),
            system_prompt_for(strategy),
        )
    }

    /// Retry policy in effect.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run one turn against a shared session.
    pub async fn run_turn(&self, handle: &SessionHandle, query: &str) -> TurnResult<TurnOutcome> {
        self.run_turn_with_cancel(handle, query, CancellationToken::new())
            .await
    }

    /// Run one turn, abandoning it when `cancel` fires.
    ///
    /// Fails with [`TurnError::ConcurrentTurn`] if another turn holds the
    /// session.
    pub async fn run_turn_with_cancel(
        &self,
        handle: &SessionHandle,
        query: &str,
        cancel: CancellationToken,
    ) -> TurnResult<TurnOutcome> {
        let mut session = handle.try_begin_turn()?;
        self.execute(&mut session, query, &cancel).await
    }

    /// Run one turn on a session the caller already holds exclusively.
    pub async fn execute(
        &self,
        session: &mut SessionState,
        query: &str,
        cancel: &CancellationToken,
    ) -> TurnResult<TurnOutcome> {
        let start = Instant::now();
        let session_id = session.id.clone();
        let mut tracker = PhaseTracker::new(&session_id);

        match self.drive(session, query, cancel, &mut tracker).await {
            Ok((next, attempts)) => {
                let gap_record = next.gap_record.clone().unwrap_or_default();
                *session = next;
                tracker.advance(TurnPhase::Idle);

                let latency_ms = start.elapsed().as_millis() as u64;
                info!(
                    session_id = %session_id,
                    extractor = self.extractor.name(),
                    needs_user_input = gap_record.has_gap(),
                    missing = ?gap_record.category_labels(),
                    questions = gap_record.follow_up_questions.len(),
                    attempts,
                    latency_ms,
                    "Follow-up turn completed"
                );

                Ok(TurnOutcome {
                    session_id,
                    gap_record,
                    attempts,
                    latency_ms,
                    phases: tracker.trail,
                })
            }
            Err(err) => {
                let failed_in = tracker.current;
                tracker.advance(TurnPhase::Failed);
                warn!(
                    session_id = %session_id,
                    phase = %failed_in,
                    error = %err,
                    "Follow-up turn failed, session unchanged"
                );
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        session: &SessionState,
        query: &str,
        cancel: &CancellationToken,
        tracker: &mut PhaseTracker,
    ) -> TurnResult<(SessionState, u32)> {
        tracker.advance(TurnPhase::Assembling);
        let mut draft = session.clone();
        draft.current_query = Some(query.to_string());
        let assembled = self.assembler.assemble(&draft)?;

        tracker.advance(TurnPhase::AwaitingModel);
        let request = ModelRequest::new(self.system_instructions.as_str(), &assembled);
        let (raw_text, attempts) = self.respond_with_retry(&draft.id, &request, cancel).await?;

        tracker.advance(TurnPhase::Extracting);
        let extracted = self.extractor.extract(&raw_text)?;
        let record = drop_repeated_questions(extracted, &asked_questions(&draft));
        let record = record.with_raw_response(raw_text);
        let next = self.updater.apply(draft, record)?;

        tracker.advance(TurnPhase::Updated);
        Ok((next, attempts))
    }

    async fn respond_with_retry(
        &self,
        session_id: &str,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> TurnResult<(String, u32)> {
        let cancelled = || TurnError::Cancelled {
            session_id: session_id.to_string(),
        };
        let mut attempts: u32 = 0;

        loop {
            if attempts > 0 {
                let delay = self.retry.delay_for(attempts);
                warn!(
                    session_id = %session_id,
                    retry = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying model request"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let call_start = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                result = tokio::time::timeout(self.retry.deadline, self.responder.respond(request)) => result,
            };
            attempts += 1;

            let err = match outcome {
                Ok(Ok(raw_text)) => {
                    debug!(
                        session_id = %session_id,
                        attempt = attempts,
                        latency_ms = call_start.elapsed().as_millis() as u64,
                        response_len = raw_text.len(),
                        "Model responded"
                    );
                    return Ok((raw_text, attempts));
                }
                Ok(Err(err)) => err,
                Err(_) => LangbaseError::Timeout {
                    timeout_ms: self.retry.deadline.as_millis() as u64,
                },
            };

            error!(
                session_id = %session_id,
                attempt = attempts,
                latency_ms = call_start.elapsed().as_millis() as u64,
                transient = err.is_transient(),
                error = %err,
                "Model request failed"
            );

            if !err.is_transient() || attempts > self.retry.max_retries {
                return Err(TurnError::from_upstream(err, attempts));
            }
        }
    }
}

/// Normalized lines of every question the agent has already sent.
fn asked_questions(session: &SessionState) -> HashSet<String> {
    session
        .context
        .turns()
        .iter()
        .filter(|turn| turn.role == Role::Agent)
        .flat_map(|turn| turn.text.lines())
        .map(normalize)
        .filter(|line| !line.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::followup::HeuristicExtractor;
    use async_trait::async_trait;
    use crate::error::LangbaseResult;

    struct Fixed(&'static str);

    #[async_trait]
    impl ModelResponder for Fixed {
        async fn respond(&self, _request: &ModelRequest) -> LangbaseResult<String> {
            Ok(self.0.to_string())
        }
    }

    fn controller(text: &'static str) -> TurnController {
        TurnController::new(
            Arc::new(Fixed(text)),
            Arc::new(HeuristicExtractor::new(5)),
            ContextAssembler::default(),
            RetryPolicy::default(),
            "instructions",
        )
    }

    #[test]
    fn test_phase_transitions() {
        use TurnPhase::*;
        assert!(Idle.can_transition_to(Assembling));
        assert!(Extracting.can_transition_to(Updated));
        assert!(Updated.can_transition_to(Idle));
        assert!(AwaitingModel.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Extracting));
        assert!(!Updated.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Idle));
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            deadline: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_policy_from_request_config() {
        let policy = RetryPolicy::from(&RequestConfig {
            timeout_ms: 1500,
            max_retries: 4,
            retry_delay_ms: 10,
        });
        assert_eq!(policy.deadline, Duration::from_millis(1500));
        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_execute_visits_every_phase() {
        let mut session = SessionState::with_id("s-phases");
        let outcome = controller("Which fund?")
            .execute(&mut session, "How is my fund doing?", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome.phases,
            vec![
                TurnPhase::Idle,
                TurnPhase::Assembling,
                TurnPhase::AwaitingModel,
                TurnPhase::Extracting,
                TurnPhase::Updated,
                TurnPhase::Idle,
            ]
        );
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.gap_record.raw_response, "Which fund?");
        assert_eq!(session.gap_record.as_ref(), Some(&outcome.gap_record));
    }

    #[tokio::test]
    async fn test_blank_query_leaves_session_untouched() {
        let mut session = SessionState::with_id("s-blank");
        let before = session.clone();
        let err = controller("Which fund?")
            .execute(&mut session, "   ", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::InvalidState { .. }));
        assert_eq!(session, before);
    }
}
