use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::messages::GenerationRequest;
use relay_core::{Event, FinishReason, Payload, SessionId, SessionState, TextGenerator};
use relay_store::{EventReplica, StoreError};

use crate::error::EngineError;
use crate::log::{ReadOutcome, SequencedLog};
use crate::producer;

/// Lifecycle of the session's single generation worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerPhase {
    Created,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Who asked for a cancel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelTrigger {
    Manual,
    Idle,
    Shutdown,
}

/// Point-in-time view of a session for status endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub model: String,
    pub state: SessionState,
    pub producer: ProducerPhase,
    pub floor: u64,
    pub head: u64,
    pub listeners: usize,
    pub replicated: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// One streaming session: its bounded log, listeners, cancel signal and
/// producer slot.
///
/// The inner mutex is only held for an append or a read snapshot, never
/// across an await. Readers park on `notify`, which is signalled after every
/// append and every cancel request.
pub struct Session {
    id: SessionId,
    model: String,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    notify: Notify,
    cancel: CancellationToken,
    idle_cancel_after: Option<Duration>,
    replica: Option<Arc<dyn EventReplica>>,
    replica_healthy: AtomicBool,
}

struct SessionInner {
    state: SessionState,
    log: SequencedLog,
    listeners: usize,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    producer: ProducerPhase,
    producer_task: Option<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
}

impl SessionInner {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    fn disarm_idle_timer(&mut self) -> bool {
        match self.idle_timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        model: impl Into<String>,
        capacity: usize,
        idle_cancel_after: Option<Duration>,
        replica: Option<Arc<dyn EventReplica>>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id,
            model: model.into(),
            created_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Active,
                log: SequencedLog::new(capacity),
                listeners: 0,
                last_activity: Instant::now(),
                last_activity_at: Utc::now(),
                producer: ProducerPhase::Created,
                producer_task: None,
                idle_timer: None,
            }),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            idle_cancel_after,
            replica_healthy: AtomicBool::new(replica.is_some()),
            replica,
        });
        session.replicate("ensure_session", |r| r.ensure_session(&session.id, &session.model));
        session
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn head(&self) -> u64 {
        self.inner.lock().log.head()
    }

    pub fn floor(&self) -> u64 {
        self.inner.lock().log.floor()
    }

    pub fn listeners(&self) -> usize {
        self.inner.lock().listeners
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    pub fn producer_phase(&self) -> ProducerPhase {
        self.inner.lock().producer
    }

    pub fn is_idle_timer_armed(&self) -> bool {
        self.inner.lock().idle_timer.is_some()
    }

    pub fn touch(&self) {
        self.inner.lock().touch();
    }

    /// Cooperative stop signal shared with the producer and the engine.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The replica this session writes to, if any. Reads stay allowed after
    /// the session stopped writing to it.
    pub fn replica(&self) -> Option<Arc<dyn EventReplica>> {
        self.replica.clone()
    }

    pub fn is_replicated(&self) -> bool {
        self.replica_healthy.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        SessionSnapshot {
            session_id: self.id.clone(),
            model: self.model.clone(),
            state: inner.state,
            producer: inner.producer,
            floor: inner.log.floor(),
            head: inner.log.head(),
            listeners: inner.listeners,
            replicated: self.is_replicated(),
            created_at: self.created_at,
            last_activity_at: inner.last_activity_at,
        }
    }

    /// Non-blocking read of everything after `since`.
    pub fn read_from(&self, since: u64) -> ReadOutcome {
        self.inner.lock().log.read_from(since)
    }

    /// Read after `since`, parking until something other than `Pending` is
    /// available. Interest is registered before the log is inspected, so an
    /// append racing with the check is never missed.
    pub async fn wait_from(&self, since: u64) -> ReadOutcome {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.read_from(since) {
                ReadOutcome::Pending => notified.await,
                other => return other,
            }
        }
    }

    /// Append one payload: reserve the sequence, write the replica, then the
    /// buffer, then wake readers.
    ///
    /// A natural `Done(stop)` written after a cancel request is recorded as
    /// `Done(cancelled)`.
    pub fn append(&self, payload: Payload) -> Result<Event, EngineError> {
        let (event, terminal_state) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return Err(EngineError::SessionSealed(self.id.clone()));
            }
            let sequence = inner
                .log
                .next_sequence()
                .map_err(|_| EngineError::SessionSealed(self.id.clone()))?;

            let payload = match payload {
                Payload::Done {
                    finish_reason: FinishReason::Stop,
                } if inner.state == SessionState::Finishing => Payload::done(FinishReason::Cancelled),
                other => other,
            };

            let terminal_state = terminal_state_for(&payload);
            if let Some(next) = terminal_state {
                inner.state = next;
                inner.disarm_idle_timer();
            }
            (Event::new(self.id.clone(), sequence, payload), terminal_state)
        };

        self.replicate("append", |r| r.append(&event));
        if let Some(state) = terminal_state {
            self.replicate("set_state", |r| r.set_state(&self.id, state));
        }

        {
            let mut inner = self.inner.lock();
            inner
                .log
                .push(event.clone())
                .map_err(|_| EngineError::SessionSealed(self.id.clone()))?;
            inner.touch();
        }
        self.notify.notify_waiters();

        if let Some(state) = terminal_state {
            info!(session_id = %self.id, sequence = event.sequence, %state, "session reached terminal state");
        }
        Ok(event)
    }

    /// Request a stop. Active moves to Finishing; Finishing is an idempotent
    /// success; terminal sessions refuse.
    pub fn cancel(&self, trigger: CancelTrigger) -> Result<SessionState, EngineError> {
        self.request_cancel(trigger, false)
    }

    fn request_cancel(
        &self,
        trigger: CancelTrigger,
        only_if_unattended: bool,
    ) -> Result<SessionState, EngineError> {
        let write_terminal_here = {
            let mut inner = self.inner.lock();
            if only_if_unattended && inner.listeners > 0 {
                return Ok(inner.state);
            }
            match inner.state {
                SessionState::Active => {
                    inner.state = SessionState::Finishing;
                    inner.touch();
                    inner.producer == ProducerPhase::Created
                }
                SessionState::Finishing => return Ok(SessionState::Finishing),
                state => {
                    return Err(EngineError::AlreadyTerminal {
                        session_id: self.id.clone(),
                        state,
                    })
                }
            }
        };

        info!(session_id = %self.id, ?trigger, "session cancel requested");
        self.cancel.cancel();
        self.notify.notify_waiters();

        // Nobody else will write the terminal event.
        if write_terminal_here {
            self.set_producer_phase(ProducerPhase::Cancelled);
            self.append(Payload::done(FinishReason::Cancelled))?;
        }
        Ok(self.state())
    }

    /// Spawn the producer. A session has at most one, ever.
    pub fn start_producer(
        self: &Arc<Self>,
        generator: Arc<dyn TextGenerator>,
        request: GenerationRequest,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if inner.producer != ProducerPhase::Created {
            return Err(EngineError::ProducerAlreadyStarted(self.id.clone()));
        }
        if inner.state != SessionState::Active {
            return Err(EngineError::AlreadyTerminal {
                session_id: self.id.clone(),
                state: inner.state,
            });
        }
        inner.producer = ProducerPhase::Running;
        inner.producer_task = Some(tokio::spawn(producer::run(
            Arc::clone(self),
            generator,
            request,
        )));
        Ok(())
    }

    pub(crate) fn set_producer_phase(&self, phase: ProducerPhase) {
        self.inner.lock().producer = phase;
    }

    pub(crate) fn take_producer_task(&self) -> Option<JoinHandle<()>> {
        self.inner.lock().producer_task.take()
    }

    /// Register a listener. The returned guard detaches on drop.
    pub fn attach(self: &Arc<Self>) -> ListenerGuard {
        let mut inner = self.inner.lock();
        inner.listeners += 1;
        inner.touch();
        if inner.disarm_idle_timer() {
            debug!(session_id = %self.id, "idle timer disarmed");
        }
        ListenerGuard {
            session: Arc::clone(self),
        }
    }

    fn detach(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.listeners = inner.listeners.saturating_sub(1);
        inner.touch();
        if inner.listeners == 0 {
            self.arm_idle_timer_locked(&mut inner);
        }
    }

    /// Arm the idle timer if nobody is listening. Used right after creation.
    pub(crate) fn arm_idle_timer(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.listeners == 0 {
            self.arm_idle_timer_locked(&mut inner);
        }
    }

    fn arm_idle_timer_locked(self: &Arc<Self>, inner: &mut SessionInner) {
        let Some(after) = self.idle_cancel_after else {
            return;
        };
        if inner.state.is_terminal() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %self.id, "no runtime to arm idle timer");
            return;
        };

        inner.disarm_idle_timer();
        let weak = Arc::downgrade(self);
        inner.idle_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(session) = weak.upgrade() {
                session.on_idle_timeout(after);
            }
        }));
        debug!(session_id = %self.id, after_secs = after.as_secs(), "idle timer armed");
    }

    fn on_idle_timeout(&self, after: Duration) {
        match self.request_cancel(CancelTrigger::Idle, true) {
            Ok(state) => {
                info!(session_id = %self.id, idle_secs = after.as_secs(), %state, "idle timeout fired")
            }
            Err(e) => debug!(session_id = %self.id, error = %e, "idle timeout after terminal"),
        }
    }

    /// Run a replica write; the first failure turns replication off for this session.
    fn replicate<F>(&self, op: &'static str, f: F)
    where
        F: FnOnce(&dyn EventReplica) -> Result<(), StoreError>,
    {
        let Some(replica) = &self.replica else {
            return;
        };
        if !self.replica_healthy.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = f(replica.as_ref()) {
            self.replica_healthy.store(false, Ordering::Release);
            warn!(
                session_id = %self.id,
                op,
                unavailable = e.is_unavailable(),
                error = %e,
                "replica write failed, continuing in memory only"
            );
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.disarm_idle_timer();
    }
}

fn terminal_state_for(payload: &Payload) -> Option<SessionState> {
    match payload {
        Payload::Data { .. } => None,
        Payload::Done {
            finish_reason: FinishReason::Stop,
        } => Some(SessionState::Finished),
        Payload::Done {
            finish_reason: FinishReason::Cancelled,
        } => Some(SessionState::Cancelled),
        Payload::Error { .. } => Some(SessionState::Errored),
    }
}

/// Keeps a session's listener count raised while alive.
pub struct ListenerGuard {
    session: Arc<Session>,
}

impl ListenerGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.session.detach();
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("session_id", &self.session.id)
            .finish()
    }
}
