use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use relay_core::{Event, SessionId, SessionState};
use relay_store::{EventReplica, ReplicaSession, StoreError};

/// Replica whose backing database is gone: every call fails.
#[derive(Default)]
pub(crate) struct UnreachableReplica {
    pub calls: AtomicUsize,
}

impl UnreachableReplica {
    fn fail<T>(&self) -> Result<T, StoreError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Err(StoreError::Database("unreachable".into()))
    }
}

impl EventReplica for UnreachableReplica {
    fn ensure_session(&self, _session_id: &SessionId, _model: &str) -> Result<(), StoreError> {
        self.fail()
    }

    fn append(&self, _event: &Event) -> Result<(), StoreError> {
        self.fail()
    }

    fn events_after(
        &self,
        _session_id: &SessionId,
        _after: u64,
        _limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        self.fail()
    }

    fn session(&self, _session_id: &SessionId) -> Result<Option<ReplicaSession>, StoreError> {
        self.fail()
    }

    fn set_state(&self, _session_id: &SessionId, _state: SessionState) -> Result<(), StoreError> {
        self.fail()
    }

    fn purge(&self, _session_id: &SessionId) -> Result<bool, StoreError> {
        self.fail()
    }

    fn purge_expired(&self, _ttl: Duration, _live: &[SessionId]) -> Result<usize, StoreError> {
        self.fail()
    }
}
