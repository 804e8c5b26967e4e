use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info};

use super::{Invocation, SessionStore};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::session::{ConversationContext, ConversationTurn, GapRecord, Role, SessionState};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed session store
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `config.path`
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Private in-memory database, for tests and `--ephemeral` runs.
    ///
    /// Pinned to a single connection that never expires, since each SQLite
    /// memory connection is its own database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                StorageError::Connection {
                    message: format!("Invalid database URL: {}", e),
                }
            })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization {
        message: e.to_string(),
    })
}

fn parse_timestamp(value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization {
            message: format!("Invalid timestamp {:?}: {}", value, e),
        })
}

fn parse_json(value: &str, what: &str) -> StorageResult<serde_json::Value> {
    serde_json::from_str(value).map_err(|e| StorageError::Serialization {
        message: format!("Corrupt {}: {}", what, e),
    })
}

#[async_trait]
impl SessionStore for SqliteStorage {
    async fn load_session(&self, id: &str) -> StorageResult<Option<SessionState>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, turn_count, current_query, context_values, gap_record, created_at, updated_at
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let turns: Vec<TurnRow> = sqlx::query_as(
            r#"
            SELECT role, text, timestamp
            FROM conversation_turns
            WHERE session_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        row.into_state(turns).map(Some)
    }

    async fn save_session(&self, session: &SessionState) -> StorageResult<()> {
        let context_values = to_json(session.context.values())?;
        let gap_record = session.gap_record.as_ref().map(to_json).transpose()?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, turn_count, current_query, context_values, gap_record, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                turn_count = excluded.turn_count,
                current_query = excluded.current_query,
                context_values = excluded.context_values,
                gap_record = excluded.gap_record,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.id)
        .bind(session.turn_count as i64)
        .bind(&session.current_query)
        .bind(&context_values)
        .bind(&gap_record)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let stored: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversation_turns WHERE session_id = ?")
                .bind(&session.id)
                .fetch_one(&mut *tx)
                .await?;
        let stored = stored as usize;

        let turns = session.context.turns();
        if stored > turns.len() {
            return Err(StorageError::Query {
                message: format!(
                    "Session {} has {} stored turns but only {} in memory; turns are append-only",
                    session.id,
                    stored,
                    turns.len()
                ),
            });
        }

        for (seq, turn) in turns.iter().enumerate().skip(stored) {
            sqlx::query(
                r#"
                INSERT INTO conversation_turns (session_id, seq, role, text, timestamp)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&session.id)
            .bind(seq as i64)
            .bind(turn.role.to_string())
            .bind(&turn.text)
            .bind(turn.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            session_id = %session.id,
            appended = turns.len() - stored,
            "Session saved"
        );
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM conversation_turns WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn log_invocation(&self, invocation: &Invocation) -> StorageResult<()> {
        let input = to_json(&invocation.input)?;
        let output = invocation.output.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO invocations (id, session_id, agent, input, output, pipe_name, latency_ms, success, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&invocation.id)
        .bind(&invocation.session_id)
        .bind(&invocation.agent)
        .bind(&input)
        .bind(&output)
        .bind(&invocation.pipe_name)
        .bind(invocation.latency_ms)
        .bind(invocation.success)
        .bind(&invocation.error)
        .bind(invocation.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn session_invocations(&self, session_id: &str) -> StorageResult<Vec<Invocation>> {
        let rows: Vec<InvocationRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, agent, input, output, pipe_name, latency_ms, success, error, created_at
            FROM invocations
            WHERE session_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Invocation::try_from).collect()
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    turn_count: i64,
    current_query: Option<String>,
    context_values: String,
    gap_record: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn into_state(self, turns: Vec<TurnRow>) -> StorageResult<SessionState> {
        let values: BTreeMap<String, String> =
            serde_json::from_str(&self.context_values).map_err(|e| {
                StorageError::Serialization {
                    message: format!("Corrupt context values for session {}: {}", self.id, e),
                }
            })?;

        let gap_record = self
            .gap_record
            .as_deref()
            .map(serde_json::from_str::<GapRecord>)
            .transpose()
            .map_err(|e| StorageError::Serialization {
                message: format!("Corrupt gap record for session {}: {}", self.id, e),
            })?;

        let turns = turns
            .into_iter()
            .map(TurnRow::into_turn)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(SessionState {
            context: ConversationContext::from_parts(turns, values),
            gap_record,
            turn_count: self.turn_count.max(0) as u64,
            current_query: self.current_query,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TurnRow {
    role: String,
    text: String,
    timestamp: String,
}

impl TurnRow {
    fn into_turn(self) -> StorageResult<ConversationTurn> {
        let role = Role::from_str(&self.role)
            .map_err(|message| StorageError::Serialization { message })?;
        let timestamp = parse_timestamp(&self.timestamp)?;
        Ok(ConversationTurn::new(role, self.text).at(timestamp))
    }
}

#[derive(sqlx::FromRow)]
struct InvocationRow {
    id: String,
    session_id: Option<String>,
    agent: String,
    input: String,
    output: Option<String>,
    pipe_name: Option<String>,
    latency_ms: Option<i64>,
    success: bool,
    error: Option<String>,
    created_at: String,
}

impl TryFrom<InvocationRow> for Invocation {
    type Error = StorageError;

    fn try_from(row: InvocationRow) -> StorageResult<Self> {
        let output = row
            .output
            .as_deref()
            .map(|output| parse_json(output, "invocation output"))
            .transpose()?;
        Ok(Self {
            input: parse_json(&row.input, "invocation input")?,
            output,
            created_at: parse_timestamp(&row.created_at)?,
            id: row.id,
            session_id: row.session_id,
            agent: row.agent,
            pipe_name: row.pipe_name,
            latency_ms: row.latency_ms,
            success: row.success,
            error: row.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::GapCategory;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn session_with_gap() -> SessionState {
        let mut record = GapRecord::empty().with_raw_response("Which fund?");
        record.missing_information.insert(GapCategory::FundName);
        record.follow_up_questions.push("Which fund?".into());

        let mut session = SessionState::with_id("s-sqlite")
            .with_context_value("risk_level", "moderate")
            .with_turn(ConversationTurn::user("How is my fund doing?"))
            .with_turn(ConversationTurn::agent("Which fund?"));
        session.gap_record = Some(record);
        session.turn_count = 1;
        session
    }

    #[tokio::test]
    async fn test_roundtrip_in_memory() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let session = session_with_gap();

        storage.save_session(&session).await.unwrap();
        let loaded = storage.load_session("s-sqlite").await.unwrap().unwrap();

        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.turn_count, 1);
        assert_eq!(loaded.gap_record, session.gap_record);
        assert_eq!(loaded.context.values(), session.context.values());
        let texts: Vec<&str> = loaded.context.turns().iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["How is my fund doing?", "Which fund?"]);
        assert_eq!(loaded.context.turns()[1].role, Role::Agent);
    }

    #[tokio::test]
    async fn test_save_appends_only_new_turns() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let mut session = session_with_gap();
        storage.save_session(&session).await.unwrap();

        session.context.push_turn(ConversationTurn::user("Axis Midcap Fund"));
        session.turn_count = 2;
        storage.save_session(&session).await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversation_turns WHERE session_id = ?")
                .bind("s-sqlite")
                .fetch_one(storage.pool())
                .await
                .unwrap();
        assert_eq!(count, 3);

        let loaded = storage.load_session("s-sqlite").await.unwrap().unwrap();
        assert_eq!(loaded.turn_count, 2);
        assert_eq!(loaded.context.turns()[2].text, "Axis Midcap Fund");
    }

    #[tokio::test]
    async fn test_save_rejects_truncated_history() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        storage.save_session(&session_with_gap()).await.unwrap();

        let truncated = SessionState::with_id("s-sqlite");
        let err = storage.save_session(&truncated).await.unwrap_err();
        assert!(matches!(err, StorageError::Query { .. }));

        let loaded = storage.load_session("s-sqlite").await.unwrap().unwrap();
        assert_eq!(loaded.turn_count, 1);
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_a_load_error() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        storage.save_session(&session_with_gap()).await.unwrap();

        sqlx::query("UPDATE conversation_turns SET timestamp = 'yesterday' WHERE session_id = ?")
            .bind("s-sqlite")
            .execute(storage.pool())
            .await
            .unwrap();
        let err = storage.load_session("s-sqlite").await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization { ref message } if message.contains("yesterday")));

        sqlx::query("DELETE FROM conversation_turns WHERE session_id = ?")
            .bind("s-sqlite")
            .execute(storage.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE sessions SET updated_at = '' WHERE id = ?")
            .bind("s-sqlite")
            .execute(storage.pool())
            .await
            .unwrap();
        let err = storage.load_session("s-sqlite").await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }

    #[test]
    fn test_parse_timestamp() {
        let parsed = parse_timestamp("2024-03-01T10:00:00+05:30").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-03-01T04:30:00+00:00");
        assert!(matches!(
            parse_timestamp("not a time"),
            Err(StorageError::Serialization { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_session() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        storage.save_session(&session_with_gap()).await.unwrap();

        storage.delete_session("s-sqlite").await.unwrap();
        assert!(storage.load_session("s-sqlite").await.unwrap().is_none());
        storage.delete_session("s-sqlite").await.unwrap();
    }

    #[tokio::test]
    async fn test_invocation_log() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let ok = Invocation::new("follow_up", json!({"query": "q1"}))
            .with_session("s-log")
            .with_pipe("follow-up-agent-v1")
            .success(json!({"needs_user_input": true}), 42);
        let failed = Invocation::new("follow_up", json!({"query": "q2"}))
            .with_session("s-log")
            .failure("timeout", 30000);

        storage.log_invocation(&ok).await.unwrap();
        storage.log_invocation(&failed).await.unwrap();

        let logged = storage.session_invocations("s-log").await.unwrap();
        assert_eq!(logged.len(), 2);
        assert!(logged.iter().any(|i| i.success && i.pipe_name.as_deref() == Some("follow-up-agent-v1")));
        assert!(logged.iter().any(|i| !i.success && i.error.as_deref() == Some("timeout")));
        assert!(storage.session_invocations("other").await.unwrap().is_empty());
    }
}
