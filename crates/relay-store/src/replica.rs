use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument};

use relay_core::{Event, SessionId, SessionState};

use crate::database::Database;
use crate::error::StoreError;
use crate::events::EventRepo;
use crate::sessions::{SessionRepo, SessionRow};

/// Snapshot of a session as known to the replica.
pub type ReplicaSession = SessionRow;

/// Durable copy of every session's event log, consulted when the in-memory
/// buffer can no longer serve a resume (eviction or restart).
pub trait EventReplica: Send + Sync {
    /// Register a session before its first event. Idempotent.
    fn ensure_session(&self, session_id: &SessionId, model: &str) -> Result<(), StoreError>;

    /// Persist one event. A second write of the same sequence is a `Conflict`.
    fn append(&self, event: &Event) -> Result<(), StoreError>;

    /// Events with `sequence > after`, ascending, at most `limit`.
    fn events_after(
        &self,
        session_id: &SessionId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError>;

    fn session(&self, session_id: &SessionId) -> Result<Option<ReplicaSession>, StoreError>;

    fn set_state(&self, session_id: &SessionId, state: SessionState) -> Result<(), StoreError>;

    /// Drop a session and its events. Returns whether anything was removed.
    fn purge(&self, session_id: &SessionId) -> Result<bool, StoreError>;

    /// Drop sessions idle for longer than `ttl`, skipping ids in `live`.
    fn purge_expired(&self, ttl: Duration, live: &[SessionId]) -> Result<usize, StoreError>;
}

/// SQLite-backed replica.
#[derive(Clone)]
pub struct SqliteReplica {
    db: Database,
}

impl SqliteReplica {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn sessions(&self) -> SessionRepo {
        SessionRepo::new(self.db.clone())
    }

    fn events(&self) -> EventRepo {
        EventRepo::new(self.db.clone())
    }
}

impl EventReplica for SqliteReplica {
    fn ensure_session(&self, session_id: &SessionId, model: &str) -> Result<(), StoreError> {
        self.sessions().ensure(session_id, model)
    }

    fn append(&self, event: &Event) -> Result<(), StoreError> {
        self.events().append(event)
    }

    fn events_after(
        &self,
        session_id: &SessionId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        self.events().list_after(session_id, after, limit)
    }

    fn session(&self, session_id: &SessionId) -> Result<Option<ReplicaSession>, StoreError> {
        self.sessions().get(session_id)
    }

    fn set_state(&self, session_id: &SessionId, state: SessionState) -> Result<(), StoreError> {
        self.sessions().update_state(session_id, state)
    }

    fn purge(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        self.sessions().delete(session_id)
    }

    #[instrument(skip(self, live), fields(ttl_secs = ttl.as_secs()))]
    fn purge_expired(&self, ttl: Duration, live: &[SessionId]) -> Result<usize, StoreError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Conflict(format!("ttl out of range: {e}")))?;
        let cutoff = Utc::now() - ttl;
        let repo = self.sessions();
        let mut purged = 0;
        for row in repo.list_stale(cutoff)? {
            if live.contains(&row.session_id) {
                continue;
            }
            if repo.delete(&row.session_id)? {
                debug!(session_id = %row.session_id, state = %row.state, "purged replica session");
                purged += 1;
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{FinishReason, Payload};

    fn sid(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    fn backdate(replica: &SqliteReplica, id: &str) {
        replica
            .database()
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE stream_sessions SET updated_at = '2000-01-01T00:00:00.000000Z'
                     WHERE session_id = ?1",
                    [id],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn session_tracks_head_and_state() {
        let replica = SqliteReplica::in_memory().unwrap();
        let id = sid("s1");
        replica.ensure_session(&id, "relay-echo").unwrap();
        replica.append(&Event::new(id.clone(), 1, Payload::data("a"))).unwrap();
        replica.append(&Event::new(id.clone(), 2, Payload::done(FinishReason::Stop))).unwrap();
        replica.set_state(&id, SessionState::Finished).unwrap();

        let meta = replica.session(&id).unwrap().unwrap();
        assert_eq!(meta.head, 2);
        assert_eq!(meta.state, SessionState::Finished);
        assert_eq!(replica.events_after(&id, 1, 10).unwrap().len(), 1);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let id = sid("s1");
        {
            let replica = SqliteReplica::open(&path).unwrap();
            replica.ensure_session(&id, "m").unwrap();
            replica.append(&Event::new(id.clone(), 1, Payload::data("kept"))).unwrap();
        }
        let replica = SqliteReplica::open(&path).unwrap();
        let events = replica.events_after(&id, 0, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, Payload::data("kept"));
        assert_eq!(replica.session(&id).unwrap().unwrap().state, SessionState::Active);
    }

    #[test]
    fn purge_expired_skips_live_and_fresh_sessions() {
        let replica = SqliteReplica::in_memory().unwrap();
        for id in ["old", "old-live", "fresh"] {
            replica.ensure_session(&sid(id), "m").unwrap();
            replica.append(&Event::new(sid(id), 1, Payload::data("x"))).unwrap();
        }
        backdate(&replica, "old");
        backdate(&replica, "old-live");

        let purged = replica
            .purge_expired(Duration::from_secs(60), &[sid("old-live")])
            .unwrap();
        assert_eq!(purged, 1);
        assert!(replica.session(&sid("old")).unwrap().is_none());
        assert!(replica.events_after(&sid("old"), 0, 10).unwrap().is_empty());
        assert!(replica.session(&sid("old-live")).unwrap().is_some());
        assert!(replica.session(&sid("fresh")).unwrap().is_some());
    }

    #[test]
    fn purge_single_session() {
        let replica = SqliteReplica::in_memory().unwrap();
        replica.ensure_session(&sid("s1"), "m").unwrap();
        assert!(replica.purge(&sid("s1")).unwrap());
        assert!(!replica.purge(&sid("s1")).unwrap());
    }
}
