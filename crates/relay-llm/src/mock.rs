use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use relay_core::messages::GenerationRequest;
use relay_core::stream::{boxed, FragmentStream};
use relay_core::{GenerationError, TextGenerator};

/// One step of a scripted generation.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Fragment(String),
    /// Sleep before the next step.
    Delay(Duration),
    /// Yield an error item, ending the stream.
    Fail(GenerationError),
    /// Yield `text` every `every` until stopped.
    Forever { text: String, every: Duration },
    /// Block until the stop token fires.
    WaitForStop,
}

/// Deterministic generator for tests: plays back a fixed script.
pub struct ScriptedGenerator {
    steps: Vec<ScriptStep>,
    start_error: Option<GenerationError>,
    honour_stop: bool,
    calls: AtomicUsize,
    last_request: Mutex<Option<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            start_error: None,
            honour_stop: true,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Convenience: plain fragments, no delays.
    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            fragments
                .into_iter()
                .map(|f| ScriptStep::Fragment(f.into()))
                .collect(),
        )
    }

    /// Convenience: `generate` itself fails.
    pub fn failing_start(error: GenerationError) -> Self {
        let mut g = Self::new(Vec::new());
        g.start_error = Some(error);
        g
    }

    /// Keep producing after the stop token fires (the producer must stop pulling).
    pub fn ignoring_stop(mut self) -> Self {
        self.honour_stop = false;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        stop: CancellationToken,
    ) -> Result<FragmentStream, GenerationError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        *self.last_request.lock() = Some(request);

        if let Some(e) = &self.start_error {
            return Err(e.clone());
        }

        let steps = self.steps.clone();
        // A token that never fires stands in for a generator that ignores stop.
        let stop = if self.honour_stop { stop } else { CancellationToken::new() };

        Ok(boxed(async_stream::stream! {
            for step in steps {
                if stop.is_cancelled() {
                    break;
                }
                match step {
                    ScriptStep::Fragment(text) => {
                        yield Ok(text);
                    }
                    ScriptStep::Delay(d) => {
                        tokio::select! {
                            _ = tokio::time::sleep(d) => {}
                            _ = stop.cancelled() => break,
                        }
                    }
                    ScriptStep::Fail(e) => {
                        yield Err(e);
                        break;
                    }
                    ScriptStep::Forever { text, every } => loop {
                        tokio::select! {
                            _ = tokio::time::sleep(every) => {}
                            _ = stop.cancelled() => break,
                        }
                        yield Ok(text.clone());
                    },
                    ScriptStep::WaitForStop => {
                        stop.cancelled().await;
                    }
                }
            }
        }))
    }
}
