use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use relay_core::{SessionId, SessionState};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::schema::timestamp;

/// A stored session row. `head` is the highest persisted sequence (0 = none).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: SessionId,
    pub model: String,
    pub state: SessionState,
    pub head: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SELECT_SESSION: &str = "SELECT s.session_id, s.model, s.state,
        COALESCE((SELECT MAX(e.sequence) FROM stream_events e WHERE e.session_id = s.session_id), 0),
        s.created_at, s.updated_at
     FROM stream_sessions s";

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert the session row unless it already exists.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn ensure(&self, session_id: &SessionId, model: &str) -> Result<(), StoreError> {
        let now = timestamp(Utc::now());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO stream_sessions (session_id, model, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![
                    session_id.as_str(),
                    model,
                    SessionState::Active.to_string(),
                    now
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn get(&self, session_id: &SessionId) -> Result<Option<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_SESSION} WHERE s.session_id = ?1"))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id, state = %state))]
    pub fn update_state(
        &self,
        session_id: &SessionId,
        state: SessionState,
    ) -> Result<(), StoreError> {
        let now = timestamp(Utc::now());
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE stream_sessions SET state = ?1, updated_at = ?2 WHERE session_id = ?3",
                rusqlite::params![state.to_string(), now, session_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            Ok(())
        })
    }

    /// Sessions not updated since `cutoff`, oldest first.
    pub fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_SESSION} WHERE s.updated_at < ?1 ORDER BY s.updated_at ASC"
            ))?;
            let mut rows = stmt.query([timestamp(cutoff)])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Remove the session and all of its events. Returns whether it existed.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        self.db.transaction(|tx| {
            tx.execute(
                "DELETE FROM stream_events WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            let removed = tx.execute(
                "DELETE FROM stream_sessions WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            Ok(removed > 0)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    const T: &str = "stream_sessions";
    let state: String = row_helpers::get(row, 2, T, "state")?;
    let head: i64 = row_helpers::get(row, 3, "stream_events", "sequence")?;
    let created_at: String = row_helpers::get(row, 4, T, "created_at")?;
    let updated_at: String = row_helpers::get(row, 5, T, "updated_at")?;

    Ok(SessionRow {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, T, "session_id")?),
        model: row_helpers::get(row, 1, T, "model")?,
        state: row_helpers::parse_enum(&state, T, "state")?,
        head: row_helpers::to_sequence(head, "stream_events", "sequence")?,
        created_at: row_helpers::parse_timestamp(&created_at, T, "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_at, T, "updated_at")?,
    })
}
