use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{HeaderValue, CACHE_CONTROL};
use axum::http::HeaderMap;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use relay_core::{Payload, SessionId, SessionState};
use relay_engine::{OpenedStream, ReplayItem, SessionSnapshot};

use crate::error::ApiError;
use crate::health::{self, HealthResponse};
use crate::request::{resolve_target, ChatCompletionRequest, ResumeQuery};
use crate::server::AppState;
use crate::wire::{self, ChatCompletion};

pub const SESSION_HEADER: &str = "x-session-id";
const LAST_EVENT_ID: &str = "last-event-id";
const ACCEL_BUFFERING: &str = "x-accel-buffering";

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ResumeQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = ChatCompletionRequest::from_slice(&body)?;
    let header_cursor = headers
        .get(LAST_EVENT_ID)
        .map(|v| v.to_str())
        .transpose()
        .map_err(|_| ApiError::BadRequest("Last-Event-ID is not valid ASCII".into()))?;

    let (session_id, since) = resolve_target(
        request.session_id.as_deref(),
        header_cursor,
        query.last_event_id.as_deref(),
    )?;
    let generation = request.generation_request(state.config.defaults);
    let prompt_tokens = generation.prompt_words();

    let opened = state.registry.open(session_id, since, generation)?;
    info!(
        session_id = %opened.session_id,
        since,
        created = opened.created,
        archived = opened.archived,
        stream = request.is_stream(),
        "completion request"
    );

    if request.is_stream() {
        stream_response(&state, opened)
    } else {
        collect_response(&state, opened, prompt_tokens).await
    }
}

fn stream_response(state: &AppState, opened: OpenedStream) -> Result<Response, ApiError> {
    let header_value = session_header_value(&opened.session_id)?;
    let OpenedStream {
        session_id,
        model,
        items,
        ..
    } = opened;

    let events = items.map(move |item| {
        Ok::<_, Infallible>(wire::sse_event(&session_id, &model, &item))
    });
    let sse = Sse::new(events).keep_alive(KeepAlive::new().interval(state.config.keep_alive));

    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert(SESSION_HEADER, header_value);
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(ACCEL_BUFFERING, HeaderValue::from_static("no"));
    Ok(response)
}

async fn collect_response(
    state: &AppState,
    opened: OpenedStream,
    prompt_tokens: usize,
) -> Result<Response, ApiError> {
    let header_value = session_header_value(&opened.session_id)?;
    let OpenedStream {
        session_id,
        model,
        mut items,
        ..
    } = opened;

    let timeout = state.config.request_timeout;
    let collected = tokio::time::timeout(timeout, async {
        let mut content = String::new();
        let mut finish_reason = None;
        while let Some(item) = items.next().await {
            match item {
                ReplayItem::Event(event) => match event.payload {
                    Payload::Data { text } => content.push_str(&text),
                    Payload::Done { finish_reason: reason } => {
                        finish_reason = Some(reason.as_str().to_string())
                    }
                    Payload::Error { error } => return Err(ApiError::Upstream(error)),
                },
                ReplayItem::Gap {
                    missing_from,
                    missing_to,
                } => warn!(%session_id, missing_from, missing_to, "collected completion has a gap"),
                ReplayItem::Interrupted { .. } => finish_reason = Some("interrupted".to_string()),
                ReplayItem::End => break,
            }
        }
        Ok((content, finish_reason))
    })
    .await
    .map_err(|_| ApiError::Timeout(timeout))?;
    let (content, finish_reason) = collected?;

    let completion = ChatCompletion::new(session_id, model, content, finish_reason, prompt_tokens);
    let mut response = Json(completion).into_response();
    response.headers_mut().insert(SESSION_HEADER, header_value);
    Ok(response)
}

fn session_header_value(session_id: &SessionId) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(session_id.as_str())
        .map_err(|e| ApiError::Internal(format!("session id not usable as header: {e}")))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub ok: bool,
    pub session_id: SessionId,
    pub state: SessionState,
}

/// POST /v1/cancel/{session_id}
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let session_id = SessionId::parse(&session_id)?;
    let state_after = state.registry.cancel(&session_id)?;
    Ok(Json(CancelResponse {
        ok: true,
        session_id,
        state: state_after,
    }))
}

/// GET /v1/sessions/{session_id}
pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let session_id = SessionId::parse(&session_id)?;
    state
        .registry
        .get(&session_id)
        .map(|session| Json(session.snapshot()))
        .ok_or_else(|| ApiError::NotFound(format!("session not found: {session_id}")))
}

/// GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = &state.registry;
    Json(health::health_check(
        state.start_time,
        registry.generator().model(),
        registry.len(),
        registry.has_replica(),
    ))
}
