use chrono::Utc;
use rusqlite::ErrorCode;
use tracing::instrument;

use relay_core::{Event, Payload, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::schema::timestamp;

pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist one event and bump the session's `updated_at`.
    ///
    /// Writing the same `(session_id, sequence)` twice is a `Conflict`, and
    /// appending to a session that was never created is `NotFound`.
    #[instrument(skip(self, event), fields(session_id = %event.session_id, sequence = event.sequence))]
    pub fn append(&self, event: &Event) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&event.payload)?;
        let sequence = i64::try_from(event.sequence)
            .map_err(|_| StoreError::Conflict(format!("sequence {} out of range", event.sequence)))?;

        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO stream_events (session_id, sequence, kind, payload, written_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    event.session_id.as_str(),
                    sequence,
                    event.kind().to_string(),
                    payload,
                    timestamp(event.timestamp),
                ],
            )
            .map_err(|e| map_insert_error(e, event))?;

            tx.execute(
                "UPDATE stream_sessions SET updated_at = ?1 WHERE session_id = ?2",
                rusqlite::params![timestamp(Utc::now()), event.session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Events with `sequence > after`, ascending, at most `limit` of them.
    #[instrument(skip(self), fields(session_id = %session_id, after))]
    pub fn list_after(
        &self,
        session_id: &SessionId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let after = i64::try_from(after).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, sequence, payload, written_at
                 FROM stream_events WHERE session_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC
                 LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), after, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn count(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM stream_events WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            row_helpers::to_sequence(n, "stream_events", "sequence")
        })
    }
}

fn map_insert_error(e: rusqlite::Error, event: &Event) -> StoreError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if err.code == ErrorCode::ConstraintViolation {
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
                return StoreError::NotFound(format!("session {}", event.session_id));
            }
            return StoreError::Conflict(format!(
                "event {}:{} already persisted",
                event.session_id, event.sequence
            ));
        }
    }
    StoreError::from(e)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<Event, StoreError> {
    const T: &str = "stream_events";
    let payload: String = row_helpers::get(row, 2, T, "payload")?;
    let written_at: String = row_helpers::get(row, 3, T, "written_at")?;
    let sequence: i64 = row_helpers::get(row, 1, T, "sequence")?;

    Ok(Event {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, T, "session_id")?),
        sequence: row_helpers::to_sequence(sequence, T, "sequence")?,
        payload: row_helpers::parse_json::<Payload>(&payload, T, "payload")?,
        timestamp: row_helpers::parse_timestamp(&written_at, T, "written_at")?,
    })
}
