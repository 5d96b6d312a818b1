use std::time::Duration;

const DEFAULT_BUFFER_CAPACITY: usize = 2048;
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(600);
const DEFAULT_IDLE_CANCEL: Duration = Duration::from_secs(3600);
const DEFAULT_MAX_SESSIONS: usize = 256;
const DEFAULT_REPLAY_PAGE: usize = 512;
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Tunables for the session registry and its sessions.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Events kept in memory per session (minimum 1).
    pub buffer_capacity: usize,
    /// How long a terminal session stays resumable after its last activity.
    pub session_ttl: Duration,
    /// Auto-cancel after this long without listeners. `None` disables.
    pub idle_cancel_after: Option<Duration>,
    /// Soft cap on sessions held in memory; only terminal ones are evicted.
    pub max_sessions: usize,
    /// Rows fetched per replica query during replay.
    pub replay_page_size: usize,
    /// How long `shutdown` waits for producers to write their terminal event.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            session_ttl: DEFAULT_SESSION_TTL,
            idle_cancel_after: Some(DEFAULT_IDLE_CANCEL),
            max_sessions: DEFAULT_MAX_SESSIONS,
            replay_page_size: DEFAULT_REPLAY_PAGE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}
