use std::time::Duration;

use crate::events::ErrorDescriptor;

/// Failures raised by a generation engine. All of them end the stream: the
/// producer never retries a partially emitted generation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("upstream error {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("rate limited")]
    RateLimited,
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("engine failure: {0}")]
    Engine(String),
}

impl GenerationError {
    /// Short classification string for logs and error descriptors.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::Upstream { .. } => "upstream_error",
            Self::RateLimited => "rate_limited",
            Self::Network(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Engine(_) => "engine_failure",
        }
    }

    /// Classify an HTTP status code from an upstream engine.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400 | 404 | 413 | 422 => Self::InvalidRequest(body),
            401 | 403 => Self::AuthenticationFailed(body),
            429 => Self::RateLimited,
            _ => Self::Upstream { status, body },
        }
    }

    pub fn descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            kind: self.error_kind().to_string(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            GenerationError::from_status(401, String::new()),
            GenerationError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            GenerationError::from_status(429, String::new()),
            GenerationError::RateLimited
        ));
        assert!(matches!(
            GenerationError::from_status(400, "bad".into()),
            GenerationError::InvalidRequest(_)
        ));
        assert!(matches!(
            GenerationError::from_status(503, "down".into()),
            GenerationError::Upstream { status: 503, .. }
        ));
    }

    #[test]
    fn descriptor_carries_kind_and_message() {
        let d = GenerationError::Engine("CUDA out of memory".into()).descriptor();
        assert_eq!(d.kind, "engine_failure");
        assert_eq!(d.message, "engine failure: CUDA out of memory");
    }

    #[test]
    fn timeout_display() {
        let e = GenerationError::Timeout(Duration::from_secs(90));
        assert_eq!(e.error_kind(), "timeout");
        assert!(e.to_string().contains("90s"));
    }
}
