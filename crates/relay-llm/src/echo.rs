use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_core::messages::GenerationRequest;
use relay_core::stream::{boxed, FragmentStream};
use relay_core::{GenerationError, TextGenerator};

const EMPTY_PROMPT_REPLY: &str = "(empty prompt)";

/// Local engine that streams the last user message back word by word.
pub struct EchoGenerator {
    model: String,
    fragment_delay: Duration,
}

impl EchoGenerator {
    pub fn new(model: impl Into<String>, fragment_delay: Duration) -> Self {
        Self {
            model: model.into(),
            fragment_delay,
        }
    }
}

/// Split into words, each carrying its leading space, capped at `max` fragments.
fn fragments(text: &str, max: usize) -> Vec<String> {
    text.split_whitespace()
        .take(max)
        .enumerate()
        .map(|(i, w)| if i == 0 { w.to_string() } else { format!(" {w}") })
        .collect()
}

#[async_trait]
impl TextGenerator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        stop: CancellationToken,
    ) -> Result<FragmentStream, GenerationError> {
        let text = request
            .last_user_text()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| EMPTY_PROMPT_REPLY.to_string());
        let parts = fragments(&text, request.max_tokens.max(1) as usize);
        let delay = self.fragment_delay;
        debug!(fragments = parts.len(), "echo generation planned");

        Ok(boxed(async_stream::stream! {
            for (i, part) in parts.into_iter().enumerate() {
                if i > 0 && !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.cancelled() => break,
                    }
                }
                if stop.is_cancelled() {
                    break;
                }
                yield Ok(part);
            }
        }))
    }
}
