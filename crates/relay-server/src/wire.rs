//! OpenAI-compatible wire shapes: streaming chunks and the collected
//! `chat.completion` body.

use axum::response::sse;
use serde::Serialize;
use tracing::warn;

use relay_core::ids::CompletionId;
use relay_core::{Event, Payload, SessionId};
use relay_engine::ReplayItem;

const SYSTEM_FINGERPRINT: &str = "relay";

/// Terminal marker clients wait for.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Serialize)]
pub struct ChunkBody<'a> {
    pub id: &'a str,
    pub object: &'static str,
    pub created: i64,
    pub model: &'a str,
    pub system_fingerprint: &'static str,
    pub choices: [ChunkChoice<'a>; 1],
    pub session_id: &'a str,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError<'a>>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice<'a> {
    pub index: u32,
    pub delta: Delta<'a>,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Default, Serialize)]
pub struct Delta<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct WireError<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub message: &'a str,
}

#[derive(Debug, Serialize)]
struct GapBody<'a> {
    session_id: &'a str,
    missing_from: u64,
    missing_to: u64,
}

#[derive(Debug, Serialize)]
struct InterruptedBody<'a> {
    session_id: &'a str,
    last_sequence: u64,
}

/// Build the chunk for one event. The first event of a session carries the
/// assistant role in its delta.
pub fn chunk_for<'a>(event: &'a Event, model: &'a str) -> ChunkBody<'a> {
    let role = (event.sequence == 1).then_some("assistant");
    let (delta, finish_reason, error) = match &event.payload {
        Payload::Data { text } => (
            Delta {
                role,
                content: Some(text.as_str()),
            },
            None,
            None,
        ),
        Payload::Done { finish_reason } => (
            Delta { role, content: None },
            Some(finish_reason.as_str()),
            None,
        ),
        Payload::Error { error } => (
            Delta { role, content: None },
            Some("error"),
            Some(WireError {
                kind: &error.kind,
                message: &error.message,
            }),
        ),
    };

    ChunkBody {
        id: event.session_id.as_str(),
        object: "chat.completion.chunk",
        created: event.timestamp.timestamp(),
        model,
        system_fingerprint: SYSTEM_FINGERPRINT,
        choices: [ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
        session_id: event.session_id.as_str(),
        sequence: event.sequence,
        error,
    }
}

/// Render one replay item as an SSE event.
pub fn sse_event(session_id: &SessionId, model: &str, item: &ReplayItem) -> sse::Event {
    let encoded = match item {
        ReplayItem::Event(event) => sse::Event::default()
            .id(event.cursor())
            .json_data(chunk_for(event, model)),
        ReplayItem::Gap {
            missing_from,
            missing_to,
        } => sse::Event::default().event("gap").json_data(GapBody {
            session_id: session_id.as_str(),
            missing_from: *missing_from,
            missing_to: *missing_to,
        }),
        ReplayItem::Interrupted {
            session_id: interrupted,
            last_sequence,
        } => sse::Event::default()
            .event("interrupted")
            .json_data(InterruptedBody {
                session_id: interrupted.as_str(),
                last_sequence: *last_sequence,
            }),
        ReplayItem::End => return sse::Event::default().data(DONE_SENTINEL),
    };
    encoded.unwrap_or_else(|e| {
        warn!(session_id = %session_id, error = %e, "could not encode stream unit");
        sse::Event::default().comment("unencodable unit skipped")
    })
}

/// Collected, non-streaming response.
#[derive(Debug, Serialize)]
pub struct ChatCompletion {
    pub id: CompletionId,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
    pub session_id: SessionId,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl ChatCompletion {
    pub fn new(
        session_id: SessionId,
        model: impl Into<String>,
        content: String,
        finish_reason: Option<String>,
        prompt_tokens: usize,
    ) -> Self {
        let completion_tokens = content.split_whitespace().count();
        Self {
            id: CompletionId::new(),
            object: "chat.completion",
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                },
                finish_reason,
            }],
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            session_id,
        }
    }
}
