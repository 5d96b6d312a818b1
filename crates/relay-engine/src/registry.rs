use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use relay_core::messages::GenerationRequest;
use relay_core::{SessionId, SessionState, TextGenerator};
use relay_store::{EventReplica, ReplicaSession};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::replay::{self, ReplayStream};
use crate::session::{CancelTrigger, ListenerGuard, Session};

/// A stream ready to be handed to a client.
pub struct OpenedStream {
    pub session_id: SessionId,
    pub model: String,
    /// A new session (and producer) was started for this request.
    pub created: bool,
    /// Served from the replica only; no live session exists.
    pub archived: bool,
    pub items: ReplayStream,
}

impl std::fmt::Debug for OpenedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedStream")
            .field("session_id", &self.session_id)
            .field("created", &self.created)
            .field("archived", &self.archived)
            .finish_non_exhaustive()
    }
}

/// What one sweep removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub expired: usize,
    pub over_capacity: usize,
    pub replica_purged: usize,
}

impl GcReport {
    pub fn total(&self) -> usize {
        self.expired + self.over_capacity + self.replica_purged
    }
}

/// Owns every live session. Constructed once and shared by the server state.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    config: EngineConfig,
    generator: Arc<dyn TextGenerator>,
    replica: Option<Arc<dyn EventReplica>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
    closing: CancellationToken,
}

impl SessionRegistry {
    pub fn new(
        config: EngineConfig,
        generator: Arc<dyn TextGenerator>,
        replica: Option<Arc<dyn EventReplica>>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            generator,
            replica,
            gc_task: Mutex::new(None),
            closing: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn generator(&self) -> &Arc<dyn TextGenerator> {
        &self.generator
    }

    pub fn has_replica(&self) -> bool {
        self.replica.is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    /// Return the live session with this id, or create it. Without an id a
    /// fresh one is generated.
    pub fn get_or_create(
        &self,
        requested: Option<SessionId>,
    ) -> Result<(Arc<Session>, bool), EngineError> {
        if self.is_closing() {
            return Err(EngineError::ShuttingDown);
        }
        let session_id = requested.unwrap_or_default();
        if let Some(session) = self.get(&session_id) {
            return Ok((session, false));
        }

        // Built outside the map: registering with the replica is store I/O.
        let fresh = Session::new(
            session_id.clone(),
            self.generator.model(),
            self.config.buffer_capacity,
            self.config.idle_cancel_after,
            self.replica.clone(),
        );
        let (session, created) = match self.sessions.entry(session_id) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&fresh));
                (fresh, true)
            }
        };

        if created {
            session.arm_idle_timer();
            info!(session_id = %session.id(), sessions = self.sessions.len(), "session created");
            self.evict_over_capacity();
        }
        Ok((session, created))
    }

    pub fn touch(&self, session_id: &SessionId) -> bool {
        match self.get(session_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Register a listener on a live session. Dropping the guard detaches it.
    pub fn attach_listener(&self, session_id: &SessionId) -> Result<ListenerGuard, EngineError> {
        self.get(session_id)
            .map(|session| session.attach())
            .ok_or_else(|| EngineError::SessionNotFound(session_id.clone()))
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn cancel(&self, session_id: &SessionId) -> Result<SessionState, EngineError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.clone()))?;
        session.cancel(CancelTrigger::Manual)
    }

    /// Resolve a request to a stream of replay items.
    ///
    /// A live session is followed from `since`. A session only the replica
    /// knows is replayed from there. An unknown id with `since > 0` is a
    /// client error; otherwise a new session is started for `request`.
    #[instrument(skip(self, request))]
    pub fn open(
        &self,
        requested: Option<SessionId>,
        since: u64,
        request: GenerationRequest,
    ) -> Result<OpenedStream, EngineError> {
        if let Some(session_id) = &requested {
            if let Some(session) = self.get(session_id) {
                return self.follow(session, since, false);
            }
            if let Some(replica) = &self.replica {
                if let Some(meta) = self.archived_session(replica.as_ref(), session_id) {
                    if since > meta.head {
                        return Err(EngineError::SequenceAhead {
                            session_id: session_id.clone(),
                            since,
                            head: meta.head,
                        });
                    }
                    debug!(head = meta.head, state = %meta.state, "replaying archived session");
                    return Ok(OpenedStream {
                        session_id: session_id.clone(),
                        model: meta.model.clone(),
                        created: false,
                        archived: true,
                        items: replay::archived(
                            Arc::clone(replica),
                            meta,
                            since,
                            self.config.replay_page_size,
                        ),
                    });
                }
            }
            if since > 0 {
                return Err(EngineError::UnknownSession(session_id.clone()));
            }
        }

        let (session, created) = self.get_or_create(requested)?;
        if created {
            session.start_producer(Arc::clone(&self.generator), request)?;
        }
        self.follow(session, since, created)
    }

    /// Replica lookup for a session with no live counterpart. A store outage
    /// reads as "not archived" so the request continues in memory.
    fn archived_session(
        &self,
        replica: &dyn EventReplica,
        session_id: &SessionId,
    ) -> Option<ReplicaSession> {
        match replica.session(session_id) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    error = %e,
                    "replica lookup failed, continuing in memory only"
                );
                None
            }
        }
    }

    fn follow(
        &self,
        session: Arc<Session>,
        since: u64,
        created: bool,
    ) -> Result<OpenedStream, EngineError> {
        let head = session.head();
        if since > head {
            let replica_head = session
                .replica()
                .and_then(|r| r.session(session.id()).ok().flatten())
                .map(|meta| meta.head)
                .unwrap_or(0);
            let known = head.max(replica_head);
            if since > known {
                return Err(EngineError::SequenceAhead {
                    session_id: session.id().clone(),
                    since,
                    head: known,
                });
            }
        }

        let guard = session.attach();
        Ok(OpenedStream {
            session_id: session.id().clone(),
            model: session.model().to_string(),
            created,
            archived: false,
            items: replay::live(guard, since, self.config.replay_page_size),
        })
    }

    /// One sweep: drop expired terminal sessions, enforce the session cap and
    /// purge stale replica rows. Never touches a session that is still running.
    pub fn garbage_collect(&self, now: Instant) -> GcReport {
        let ttl = self.config.session_ttl;
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.is_terminal()
                    && now.saturating_duration_since(session.last_activity()) >= ttl
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut report = GcReport::default();
        for session_id in &expired {
            if self
                .sessions
                .remove_if(session_id, |_, session| session.is_terminal())
                .is_some()
            {
                report.expired += 1;
            }
        }
        report.over_capacity = self.evict_over_capacity();

        if let Some(replica) = &self.replica {
            let live: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
            match replica.purge_expired(ttl, &live) {
                Ok(purged) => report.replica_purged = purged,
                Err(e) => warn!(error = %e, "replica sweep failed, retrying next cycle"),
            }
        }
        report
    }

    /// Evict the least recently active terminal sessions while over the cap.
    fn evict_over_capacity(&self) -> usize {
        let excess = self.sessions.len().saturating_sub(self.config.max_sessions);
        if excess == 0 {
            return 0;
        }

        let mut terminal: Vec<(Instant, SessionId)> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_terminal())
            .map(|entry| (entry.value().last_activity(), entry.key().clone()))
            .collect();
        terminal.sort();

        let mut evicted = 0;
        for (_, session_id) in terminal.into_iter().take(excess) {
            if self
                .sessions
                .remove_if(&session_id, |_, session| session.is_terminal())
                .is_some()
            {
                evicted += 1;
            }
        }
        if evicted < excess {
            debug!(
                sessions = self.sessions.len(),
                max = self.config.max_sessions,
                "over session cap with only running sessions left"
            );
        }
        evicted
    }

    /// Start the periodic sweep. Replaces any previous sweep task.
    pub fn spawn_gc(self: &Arc<Self>, interval: Duration) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let closing = self.closing.clone();
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = closing.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let report = registry.garbage_collect(Instant::now());
                if report.total() > 0 {
                    info!(
                        expired = report.expired,
                        over_capacity = report.over_capacity,
                        replica_purged = report.replica_purged,
                        sessions = registry.len(),
                        "session sweep"
                    );
                }
            }
            debug!("session sweep stopped");
        });

        if let Some(previous) = self.gc_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Cancel every live session, stop the sweep and give producers the
    /// configured grace period to write their terminal events.
    pub async fn shutdown(&self) {
        self.closing.cancel();
        if let Some(gc) = self.gc_task.lock().take() {
            gc.abort();
        }

        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        let mut producers = Vec::new();
        for session in &sessions {
            match session.cancel(CancelTrigger::Shutdown) {
                Ok(_) | Err(EngineError::AlreadyTerminal { .. }) => {}
                Err(e) => warn!(session_id = %session.id(), error = %e, "cancel on shutdown failed"),
            }
            if let Some(task) = session.take_producer_task() {
                producers.push(task);
            }
        }

        let pending = producers.len();
        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, futures::future::join_all(producers))
            .await
            .is_err()
        {
            warn!(pending, grace_ms = grace.as_millis() as u64, "producers still running after grace period");
        }
        info!(sessions = sessions.len(), "session registry shut down");
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(gc) = self.gc_task.get_mut().take() {
            gc.abort();
        }
    }
}
