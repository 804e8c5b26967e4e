use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{Invocation, SessionStore};
use crate::error::{StorageError, StorageResult};
use crate::session::SessionState;

/// Process-local session store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    sessions: RwLock<HashMap<String, SessionState>>,
    invocations: RwLock<Vec<Invocation>>,
}

impl InMemoryStorage {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemoryStorage {
    async fn load_session(&self, id: &str) -> StorageResult<Option<SessionState>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save_session(&self, session: &SessionState) -> StorageResult<()> {
        let mut sessions = self.sessions.write().await;
        if let Some(stored) = sessions.get(&session.id) {
            let stored_turns = stored.context.turns();
            let prefix_kept = session
                .context
                .turns()
                .get(..stored_turns.len())
                .is_some_and(|prefix| prefix == stored_turns);
            if !prefix_kept {
                return Err(StorageError::Query {
                    message: format!(
                        "Session {} would lose or rewrite stored turns; turns are append-only",
                        session.id
                    ),
                });
            }
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn log_invocation(&self, invocation: &Invocation) -> StorageResult<()> {
        self.invocations.write().await.push(invocation.clone());
        Ok(())
    }

    async fn session_invocations(&self, session_id: &str) -> StorageResult<Vec<Invocation>> {
        Ok(self
            .invocations
            .read()
            .await
            .iter()
            .filter(|i| i.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect())
    }
}
