//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Model label of the configured generator.
    pub model: String,
    /// Sessions currently held in memory.
    pub sessions: usize,
    /// Whether events are mirrored to the durable replica.
    pub persistence: bool,
    pub uptime_secs: u64,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    model: &str,
    sessions: usize,
    persistence: bool,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        model: model.to_string(),
        sessions,
        persistence,
        uptime_secs: start_time.elapsed().as_secs(),
    }
}
