//! Axum HTTP server: router, shared state and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use relay_engine::SessionRegistry;

use crate::handlers;
use crate::request::RequestDefaults;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Interval of SSE keep-alive comments.
    pub keep_alive: Duration,
    /// Upper bound for non-streaming requests.
    pub request_timeout: Duration,
    pub defaults: RequestDefaults,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            keep_alive: Duration::from_secs(15),
            request_timeout: Duration::from_secs(300),
            defaults: RequestDefaults::default(),
        }
    }
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, config: ServerConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
///
/// The timeout layer only wraps the control routes; the completions route
/// enforces its own deadline on the non-streaming path so that SSE streams
/// can stay open.
pub fn build_router(state: AppState) -> Router {
    let control = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/v1/cancel/{session_id}", post(handlers::cancel_session))
        .route("/v1/sessions/{session_id}", get(handlers::session_status))
        .layer(TimeoutLayer::new(state.config.request_timeout));

    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .merge(control)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve in the background. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let router = build_router(AppState::new(registry, config));
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone().cancelled_owned();

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await
        {
            error!(error = %e, "server stopped with error");
        }
    });

    info!(addr = %local_addr, "relay server listening");
    Ok(ServerHandle {
        addr: local_addr,
        shutdown,
        task,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and wait for open ones to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "server task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use relay_core::{GenerationError, SessionId, SessionState, TextGenerator};
    use relay_engine::EngineConfig;
    use relay_llm::{EchoGenerator, ScriptStep, ScriptedGenerator};
    use tower::ServiceExt;

    fn app(generator: Arc<dyn TextGenerator>) -> (Router, Arc<SessionRegistry>) {
        let config = EngineConfig {
            idle_cancel_after: None,
            ..EngineConfig::default()
        };
        let registry = Arc::new(SessionRegistry::new(config, generator, None));
        let router = build_router(AppState::new(Arc::clone(&registry), ServerConfig::default()));
        (router, registry)
    }

    fn completion(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        serde_json::from_str(&body_text(resp).await).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let (app, _) = app(Arc::new(EchoGenerator::new("relay-echo", Duration::ZERO)));
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["model"], "relay-echo");
        assert_eq!(body["persistence"], false);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (app, _) = app(Arc::new(EchoGenerator::new("m", Duration::ZERO)));
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn streaming_completion_emits_chunks_and_sentinel() {
        let (app, _) = app(Arc::new(ScriptedGenerator::fragments(["Hello", " world"])));
        let resp = app
            .oneshot(completion(serde_json::json!({
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
                "session_id": "t1"
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-session-id"], "t1");
        assert_eq!(resp.headers()["x-accel-buffering"], "no");
        assert!(resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let body = body_text(resp).await;
        assert!(body.contains("t1:1"));
        assert!(body.contains(r#""role":"assistant""#));
        assert!(body.contains(r#""content":"Hello""#));
        assert!(body.contains(r#""content":" world""#));
        assert!(body.contains(r#""finish_reason":"stop""#));
        assert!(body.trim_end().ends_with("[DONE]"));
    }

    #[tokio::test]
    async fn resume_skips_seen_events() {
        let (app, registry) = app(Arc::new(ScriptedGenerator::fragments(["a", "b", "c"])));
        let first = app
            .clone()
            .oneshot(completion(serde_json::json!({
                "messages": [{"role": "user", "content": "go"}],
                "session_id": "t2"
            })))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let session = registry.get(&SessionId::from_raw("t2")).unwrap();
        assert_eq!(session.state(), SessionState::Finished);

        let resume = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("last-event-id", "t2:2")
            .body(Body::from(
                r#"{"messages":[{"role":"user","content":"go"}],"stream":true}"#,
            ))
            .unwrap();
        let body = body_text(app.oneshot(resume).await.unwrap()).await;
        assert!(!body.contains(r#""sequence":1}"#));
        assert!(!body.contains(r#""sequence":2}"#));
        assert!(body.contains(r#""content":"c""#));
        assert!(body.contains(r#""sequence":4}"#));
        assert!(body.contains("[DONE]"));
    }

    #[tokio::test]
    async fn non_streaming_collects_the_reply() {
        let (app, _) = app(Arc::new(EchoGenerator::new("relay-echo", Duration::ZERO)));
        let resp = app
            .oneshot(completion(serde_json::json!({
                "messages": [{"role": "user", "content": "hello there"}]
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let sid = resp.headers()["x-session-id"].to_str().unwrap().to_string();
        assert!(sid.starts_with("sess_"));

        let body = body_json(resp).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "hello there");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["completion_tokens"], 2);
        assert_eq!(body["session_id"], sid);
    }

    #[tokio::test]
    async fn engine_failure_is_bad_gateway_without_stream() {
        let (app, _) = app(Arc::new(ScriptedGenerator::failing_start(
            GenerationError::RateLimited,
        )));
        let resp = app
            .oneshot(completion(serde_json::json!({
                "messages": [{"role": "user", "content": "x"}]
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["type"], "upstream_error");
    }

    #[tokio::test]
    async fn client_errors_are_400() {
        let (app, _) = app(Arc::new(EchoGenerator::new("m", Duration::ZERO)));

        let empty = completion(serde_json::json!({"messages": []}));
        let resp = app.clone().oneshot(empty).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["type"], "invalid_request_error");

        let unknown = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions?last_event_id=ghost:3")
            .body(Body::from(r#"{"messages":[{"role":"user","content":"x"}]}"#))
            .unwrap();
        let resp = app.clone().oneshot(unknown).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let mismatch = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("last-event-id", "other:1")
            .body(Body::from(
                r#"{"messages":[{"role":"user","content":"x"}],"session_id":"mine"}"#,
            ))
            .unwrap();
        let resp = app.oneshot(mismatch).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cancel_statuses() {
        let generator = Arc::new(ScriptedGenerator::new(vec![ScriptStep::WaitForStop]));
        let (app, registry) = app(generator);

        let cancel = |id: &str| {
            Request::builder()
                .method("POST")
                .uri(format!("/v1/cancel/{id}"))
                .body(Body::empty())
                .unwrap()
        };

        let resp = app.clone().oneshot(cancel("missing")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let (session, _) = registry
            .get_or_create(Some(SessionId::from_raw("live")))
            .unwrap();
        session
            .start_producer(
                Arc::clone(registry.generator()),
                relay_core::messages::GenerationRequest::new(vec![
                    relay_core::messages::ChatMessage::user("x"),
                ]),
            )
            .unwrap();

        let resp = app.clone().oneshot(cancel("live")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["session_id"], "live");
        assert_eq!(body["state"], "finishing");

        tokio::time::timeout(Duration::from_secs(5), async {
            while !session.is_terminal() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let resp = app.oneshot(cancel("live")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn session_snapshot_route() {
        let (app, _) = app(Arc::new(ScriptedGenerator::fragments(["x", "y"])));
        app.clone()
            .oneshot(completion(serde_json::json!({
                "messages": [{"role": "user", "content": "go"}],
                "session_id": "snap"
            })))
            .await
            .unwrap();

        let req = Request::builder()
            .uri("/v1/sessions/snap")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["session_id"], "snap");
        assert_eq!(body["state"], "finished");
        assert_eq!(body["head"], 3);
        assert_eq!(body["floor"], 1);

        let req = Request::builder()
            .uri("/v1/sessions/unknown")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn finished_session_resumes_from_replica_after_restart() {
        let replica: Arc<dyn relay_store::EventReplica> =
            Arc::new(relay_store::SqliteReplica::in_memory().unwrap());
        let engine = EngineConfig {
            idle_cancel_after: None,
            ..EngineConfig::default()
        };

        let before = Arc::new(SessionRegistry::new(
            engine.clone(),
            Arc::new(ScriptedGenerator::fragments(["one", " two"])),
            Some(Arc::clone(&replica)),
        ));
        let first = build_router(AppState::new(before, ServerConfig::default()))
            .oneshot(completion(serde_json::json!({
                "messages": [{"role": "user", "content": "go"}],
                "session_id": "kept"
            })))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let after = Arc::new(SessionRegistry::new(
            engine,
            Arc::new(ScriptedGenerator::fragments(["never"])),
            Some(replica),
        ));
        let resume = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions?last_event_id=kept:1")
            .body(Body::from(
                r#"{"messages":[{"role":"user","content":"go"}],"stream":true}"#,
            ))
            .unwrap();
        let resp = build_router(AppState::new(after, ServerConfig::default()))
            .oneshot(resume)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_text(resp).await;
        assert!(body.contains(r#""content":" two""#));
        assert!(body.contains(r#""finish_reason":"stop""#));
        assert!(!body.contains("never"));
        assert!(!body.contains("interrupted"));
        assert!(body.contains("[DONE]"));
    }

    #[tokio::test]
    async fn server_starts_and_shuts_down() {
        let (_, registry) = app(Arc::new(EchoGenerator::new("m", Duration::ZERO)));
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        let handle = start(config, registry).await.unwrap();
        assert!(handle.port() > 0);
        handle.shutdown().await;
    }
}
