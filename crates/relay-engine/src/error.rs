use relay_core::ids::SessionIdError;
use relay_core::{SessionId, SessionState};
use relay_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(#[from] SessionIdError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {session_id} already {state}")]
    AlreadyTerminal {
        session_id: SessionId,
        state: SessionState,
    },

    #[error("session {0} is sealed by a terminal event")]
    SessionSealed(SessionId),

    #[error("session {0} already has a producer")]
    ProducerAlreadyStarted(SessionId),

    #[error("unknown session {0}: nothing to resume")]
    UnknownSession(SessionId),

    #[error("cursor {since} is ahead of session {session_id} (last sequence {head})")]
    SequenceAhead {
        session_id: SessionId,
        since: u64,
        head: u64,
    },

    #[error("registry is shutting down")]
    ShuttingDown,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Errors caused by what the client sent, reported before any stream opens.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSessionId(_) | Self::UnknownSession(_) | Self::SequenceAhead { .. }
        )
    }
}
