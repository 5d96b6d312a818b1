use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream, StreamExt};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use relay_core::messages::GenerationRequest;
use relay_core::stream::{boxed, FragmentStream};
use relay_core::{GenerationError, TextGenerator};

use crate::sse::{self, ChunkDelta};

const COMPLETIONS_PATH: &str = "/v1/chat/completions";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    /// Base URL, e.g. `http://localhost:8000`. A full completions URL is accepted too.
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub idle_timeout: Duration,
}

impl UpstreamConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(api_key.into()));
        self
    }
}

/// Forwards generation to an OpenAI-compatible streaming endpoint.
pub struct UpstreamGenerator {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    idle_timeout: Duration,
}

impl UpstreamGenerator {
    pub fn new(config: UpstreamConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GenerationError::Network(format!("build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: completions_endpoint(&config.base_url),
            api_key: config.api_key,
            model: config.model,
            idle_timeout: config.idle_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.text() }))
            .collect();
        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true,
        })
    }
}

fn completions_endpoint(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with(COMPLETIONS_PATH) {
        base.to_string()
    } else {
        format!("{base}{COMPLETIONS_PATH}")
    }
}

#[async_trait]
impl TextGenerator for UpstreamGenerator {
    fn name(&self) -> &str {
        "upstream"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, request, stop), fields(model = %self.model, endpoint = %self.endpoint))]
    async fn generate(
        &self,
        request: GenerationRequest,
        stop: CancellationToken,
    ) -> Result<FragmentStream, GenerationError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("accept", "text/event-stream")
            .json(&self.request_body(&request));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = tokio::select! {
            resp = req.send() => resp.map_err(|e| GenerationError::Network(e.to_string()))?,
            _ = stop.cancelled() => return Ok(boxed(futures::stream::empty())),
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::from_status(status, body));
        }

        debug!("upstream stream opened");
        let stream = SseStream::with_idle_timeout(resp.bytes_stream(), self.idle_timeout);
        Ok(boxed(stream.take_until(stop.cancelled_owned())))
    }
}

/// Wraps a byte stream and yields text fragments from `chat.completion.chunk`
/// payloads. Ends on `[DONE]`, on the first error, or when the body ends.
/// Errors if no data arrives within `idle_duration`.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, String>> + Send>>,
    buffer: String,
    pending: VecDeque<Result<String, GenerationError>>,
    finished: bool,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
}

impl SseStream {
    fn with_idle_timeout<S, E>(byte_stream: S, idle_timeout: Duration) -> Self
    where
        S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
        E: std::fmt::Display,
    {
        Self {
            inner: Box::pin(byte_stream.map(|r| r.map_err(|e| e.to_string()))),
            buffer: String::new(),
            pending: VecDeque::new(),
            finished: false,
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
        }
    }

    fn consume(&mut self, chunk: &str) {
        for frame in sse::parse_sse_lines(chunk) {
            if self.finished {
                return;
            }
            match sse::parse_chunk(&frame.data) {
                ChunkDelta::Text(text) => self.pending.push_back(Ok(text)),
                ChunkDelta::Skip => {}
                ChunkDelta::Done => self.finished = true,
                ChunkDelta::Error(e) => {
                    self.pending.push_back(Err(e));
                    self.finished = true;
                }
            }
        }
    }

    /// Move every complete `\n\n`-terminated frame out of the buffer.
    fn drain_complete_frames(&mut self) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let chunk: String = self.buffer.drain(..pos + 2).collect();
            self.consume(&chunk);
        }
    }
}

impl Stream for SseStream {
    type Item = Result<String, GenerationError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let text = String::from_utf8_lossy(&bytes).replace("\r\n", "\n");
                    self.buffer.push_str(&text);
                    self.drain_complete_frames();
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(GenerationError::StreamInterrupted(e))));
                }
                Poll::Ready(None) => {
                    let remaining = std::mem::take(&mut self.buffer);
                    if !remaining.trim().is_empty() {
                        self.consume(&remaining);
                    }
                    self.finished = true;
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(Err(GenerationError::Timeout(
                            self.idle_duration,
                        ))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
