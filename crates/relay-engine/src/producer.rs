use std::sync::Arc;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use relay_core::messages::GenerationRequest;
use relay_core::{FinishReason, GenerationError, Payload, TextGenerator};

use crate::error::EngineError;
use crate::session::{ProducerPhase, Session};

/// How the fragment loop ended.
#[derive(Debug)]
enum Exit {
    Exhausted,
    Stopped,
    Failed(GenerationError),
    /// The session was sealed under us; nothing left to write.
    Sealed,
}

/// Body of the per-session producer task: pull fragments, append them, and
/// always finish with exactly one terminal event.
pub(crate) async fn run(
    session: Arc<Session>,
    generator: Arc<dyn TextGenerator>,
    request: GenerationRequest,
) {
    let span = tracing::info_span!(
        "producer",
        session_id = %session.id(),
        generator = generator.name(),
        model = generator.model(),
    );
    async move {
        let stop = session.cancel_token();
        let started = Instant::now();
        let (exit, fragments) = pull_fragments(&session, generator.as_ref(), request, &stop).await;

        let terminal = match exit {
            Exit::Exhausted => Payload::done(FinishReason::Stop),
            Exit::Stopped => Payload::done(FinishReason::Cancelled),
            Exit::Failed(e) => {
                warn!(error = %e, kind = e.error_kind(), "generation failed");
                Payload::Error {
                    error: e.descriptor(),
                }
            }
            Exit::Sealed => {
                debug!("session already sealed");
                return;
            }
        };

        match session.append(terminal) {
            Ok(event) => {
                let phase = match &event.payload {
                    Payload::Done {
                        finish_reason: FinishReason::Stop,
                    } => ProducerPhase::Completed,
                    Payload::Done {
                        finish_reason: FinishReason::Cancelled,
                    } => ProducerPhase::Cancelled,
                    _ => ProducerPhase::Failed,
                };
                session.set_producer_phase(phase);
                info!(
                    fragments,
                    last_sequence = event.sequence,
                    phase = ?phase,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "producer finished"
                );
            }
            Err(e) => warn!(error = %e, "could not write terminal event"),
        }
    }
    .instrument(span)
    .await
}

async fn pull_fragments(
    session: &Session,
    generator: &dyn TextGenerator,
    request: GenerationRequest,
    stop: &CancellationToken,
) -> (Exit, usize) {
    let mut fragments = 0usize;

    let mut stream = tokio::select! {
        biased;
        _ = stop.cancelled() => return (Exit::Stopped, fragments),
        started = generator.generate(request, stop.clone()) => match started {
            Ok(stream) => stream,
            Err(e) => return (Exit::Failed(e), fragments),
        },
    };

    loop {
        // Cancel is checked before every pull. A fragment that already
        // arrived is still appended below.
        let item = tokio::select! {
            biased;
            _ = stop.cancelled() => return (Exit::Stopped, fragments),
            item = stream.next() => item,
        };

        match item {
            Some(Ok(text)) => {
                if text.is_empty() {
                    continue;
                }
                match session.append(Payload::data(text)) {
                    Ok(_) => fragments += 1,
                    Err(EngineError::SessionSealed(_)) => return (Exit::Sealed, fragments),
                    Err(e) => return (Exit::Failed(GenerationError::Engine(e.to_string())), fragments),
                }
            }
            Some(Err(e)) => return (Exit::Failed(e), fragments),
            None if stop.is_cancelled() => return (Exit::Stopped, fragments),
            None => return (Exit::Exhausted, fragments),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relay_core::messages::ChatMessage;
    use relay_core::{EventKind, SessionId, SessionState};
    use relay_llm::{ScriptStep, ScriptedGenerator};

    use super::*;
    use crate::log::ReadOutcome;
    use crate::session::CancelTrigger;

    fn session() -> Arc<Session> {
        Session::new(SessionId::from_raw("p1"), "scripted-model", 64, None, None)
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new(vec![ChatMessage::user("hi")])
    }

    fn events(session: &Session) -> Vec<relay_core::Event> {
        match session.read_from(0) {
            ReadOutcome::Events(events) => events,
            other => panic!("expected events, got {other:?}"),
        }
    }

    async fn wait_terminal(session: &Session) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !session.is_terminal() {
                tokio::task::yield_now().await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_writes_done_stop() {
        let session = session();
        let gen = Arc::new(ScriptedGenerator::fragments(["a", "", "b"]));
        session.start_producer(gen, request()).unwrap();
        wait_terminal(&session).await;

        let evs = events(&session);
        assert_eq!(evs.len(), 3, "empty fragment is skipped");
        assert_eq!(evs[0].payload, Payload::data("a"));
        assert_eq!(evs[1].payload, Payload::data("b"));
        assert_eq!(evs[2].payload, Payload::done(FinishReason::Stop));
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(session.producer_phase(), ProducerPhase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_writes_error_event() {
        let session = session();
        let gen = Arc::new(ScriptedGenerator::failing_start(GenerationError::RateLimited));
        session.start_producer(gen, request()).unwrap();
        wait_terminal(&session).await;

        let evs = events(&session);
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].kind(), EventKind::Error);
        assert_eq!(session.state(), SessionState::Errored);
        assert_eq!(session.producer_phase(), ProducerPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn mid_stream_failure_keeps_earlier_fragments() {
        let session = session();
        let gen = Arc::new(ScriptedGenerator::new(vec![
            ScriptStep::Fragment("one".into()),
            ScriptStep::Fail(GenerationError::StreamInterrupted("reset".into())),
        ]));
        session.start_producer(gen, request()).unwrap();
        wait_terminal(&session).await;

        let evs = events(&session);
        assert_eq!(evs.len(), 2);
        assert_eq!(evs[0].payload, Payload::data("one"));
        assert_eq!(evs[1].kind(), EventKind::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_a_generator_that_ignores_it() {
        let session = session();
        let gen = Arc::new(
            ScriptedGenerator::new(vec![ScriptStep::Forever {
                text: "tick".into(),
                every: Duration::from_millis(10),
            }])
            .ignoring_stop(),
        );
        session.start_producer(gen, request()).unwrap();
        tokio::time::sleep(Duration::from_millis(35)).await;

        session.cancel(CancelTrigger::Manual).unwrap();
        wait_terminal(&session).await;

        let evs = events(&session);
        let last = evs.last().unwrap();
        assert_eq!(last.payload, Payload::done(FinishReason::Cancelled));
        assert!(evs[..evs.len() - 1]
            .iter()
            .all(|e| e.payload == Payload::data("tick")));
        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(session.producer_phase(), ProducerPhase::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected() {
        let session = session();
        let gen = Arc::new(ScriptedGenerator::new(vec![ScriptStep::WaitForStop]));
        session.start_producer(gen.clone(), request()).unwrap();
        let err = session.start_producer(gen, request()).unwrap_err();
        assert!(matches!(err, EngineError::ProducerAlreadyStarted(_)));
    }
}
