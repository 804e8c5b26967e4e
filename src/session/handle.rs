use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use super::SessionState;
use crate::error::{TurnError, TurnResult};

/// Shared handle to one session's state.
///
/// Clones share the same state. At most one turn may hold the state at a
/// time; a second caller is refused instead of queued, so an interleaved
/// append can never reorder the conversation. A closed handle refuses all
/// further turns.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    state: Arc<Mutex<SessionState>>,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Wrap a session state.
    pub fn new(state: SessionState) -> Self {
        Self {
            id: Arc::from(state.id.as_str()),
            state: Arc::new(Mutex::new(state)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Copy of the current state. Waits for an in-flight turn to finish.
    pub async fn snapshot(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    /// Claim exclusive access for one turn.
    ///
    /// Fails with [`TurnError::ConcurrentTurn`] when another turn holds the
    /// session, and with [`TurnError::InvalidState`] once the handle is closed.
    pub fn try_begin_turn(&self) -> TurnResult<MutexGuard<'_, SessionState>> {
        let guard = self
            .state
            .try_lock()
            .map_err(|_| TurnError::ConcurrentTurn {
                session_id: self.id.to_string(),
            })?;
        if self.is_closed() {
            return Err(TurnError::InvalidState {
                message: format!("Session {} has ended", self.id),
            });
        }
        Ok(guard)
    }

    /// Refuse every later turn on this handle and its clones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether two handles point at the same session state.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}
