use serde::Deserialize;

use relay_core::messages::{ChatMessage, GenerationRequest};
use relay_core::{ResumeCursor, SessionId};

use crate::error::ApiError;

/// Body of `POST /v1/chat/completions`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Defaults applied when a request leaves a knob unset.
#[derive(Debug, Clone, Copy)]
pub struct RequestDefaults {
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

impl ChatCompletionRequest {
    pub fn from_slice(body: &[u8]) -> Result<Self, ApiError> {
        let request: Self = serde_json::from_slice(body)
            .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if self.messages.is_empty() {
            return Err(ApiError::BadRequest("messages must not be empty".into()));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ApiError::BadRequest(format!(
                    "temperature {t} outside 0..=2"
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(ApiError::BadRequest("max_tokens must be positive".into()));
        }
        Ok(())
    }

    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn generation_request(&self, defaults: RequestDefaults) -> GenerationRequest {
        GenerationRequest {
            messages: self.messages.clone(),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
        }
    }
}

/// Query string of the completions route.
#[derive(Debug, Default, Deserialize)]
pub struct ResumeQuery {
    #[serde(default)]
    pub last_event_id: Option<String>,
}

/// Work out which session to serve and where to start.
///
/// The `Last-Event-ID` header wins over the query parameter. A cursor naming
/// a different session than the body is rejected.
pub fn resolve_target(
    body_session: Option<&str>,
    header_cursor: Option<&str>,
    query_cursor: Option<&str>,
) -> Result<(Option<SessionId>, u64), ApiError> {
    let body_session = body_session
        .filter(|s| !s.trim().is_empty())
        .map(|s| SessionId::parse(s.trim()))
        .transpose()?;

    let cursor = header_cursor
        .or(query_cursor)
        .filter(|c| !c.trim().is_empty())
        .map(ResumeCursor::parse)
        .transpose()?;

    match (body_session, cursor) {
        (Some(body), Some(cursor)) if body != cursor.session_id => Err(ApiError::BadRequest(
            format!(
                "cursor session {} does not match session_id {body}",
                cursor.session_id
            ),
        )),
        (_, Some(cursor)) => Ok((Some(cursor.session_id), cursor.sequence)),
        (body, None) => Ok((body, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_body_uses_defaults() {
        let req = ChatCompletionRequest::from_slice(
            br#"{"messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert!(!req.is_stream());
        let gen = req.generation_request(RequestDefaults {
            max_tokens: 64,
            temperature: 0.2,
        });
        assert_eq!(gen.max_tokens, 64);
        assert_eq!(gen.temperature, 0.2);
        assert_eq!(gen.last_user_text().as_deref(), Some("hi"));
    }

    #[test]
    fn empty_messages_rejected() {
        let err = ChatCompletionRequest::from_slice(br#"{"messages":[]}"#).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn malformed_json_rejected() {
        let err = ChatCompletionRequest::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn header_cursor_beats_query() {
        let (sid, since) = resolve_target(None, Some("a:4"), Some("b:9")).unwrap();
        assert_eq!(sid.unwrap().as_str(), "a");
        assert_eq!(since, 4);
    }

    #[test]
    fn query_cursor_used_without_header() {
        let (sid, since) = resolve_target(Some("b"), None, Some("b:9")).unwrap();
        assert_eq!(sid.unwrap().as_str(), "b");
        assert_eq!(since, 9);
    }

    #[test]
    fn mismatched_cursor_is_client_error() {
        let err = resolve_target(Some("a"), Some("b:1"), None).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn no_cursor_starts_at_zero() {
        assert_eq!(resolve_target(None, None, None).unwrap(), (None, 0));
        let (sid, since) = resolve_target(Some("mine"), None, None).unwrap();
        assert_eq!(sid.unwrap().as_str(), "mine");
        assert_eq!(since, 0);
    }

    #[test]
    fn bad_session_id_rejected() {
        assert!(resolve_target(Some("has space"), None, None).is_err());
        assert!(resolve_target(None, Some("nocolon"), None).is_err());
    }
}
