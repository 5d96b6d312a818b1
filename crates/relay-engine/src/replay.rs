use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tracing::{debug, warn};

use relay_core::{Event, SessionId};
use relay_store::{EventReplica, ReplicaSession};

use crate::log::ReadOutcome;
use crate::session::{ListenerGuard, Session};

/// One unit handed to a listener.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplayItem {
    Event(Event),
    /// Sequences `missing_from ..= missing_to` are gone from every store.
    Gap { missing_from: u64, missing_to: u64 },
    /// The session never reached a terminal event before the process that
    /// owned it went away.
    Interrupted {
        session_id: SessionId,
        last_sequence: u64,
    },
    /// Nothing more will follow.
    End,
}

pub type ReplayStream = Pin<Box<dyn Stream<Item = ReplayItem> + Send>>;

/// Follow a live session from `since` until its terminal event.
///
/// The listener guard lives inside the stream, so dropping the stream (for
/// example when the client disconnects) detaches the listener.
pub fn live(guard: ListenerGuard, since: u64, page_size: usize) -> ReplayStream {
    let session = Arc::clone(guard.session());
    Box::pin(async_stream::stream! {
        let _guard = guard;
        let mut cursor = since;
        loop {
            match session.wait_from(cursor).await {
                ReadOutcome::Events(events) => {
                    for event in events {
                        cursor = event.sequence;
                        let terminal = event.is_terminal();
                        yield ReplayItem::Event(event);
                        if terminal {
                            yield ReplayItem::End;
                            return;
                        }
                    }
                }
                ReadOutcome::Gap { floor } => {
                    for event in fill_from_replica(&session, cursor, floor, page_size) {
                        cursor = event.sequence;
                        yield ReplayItem::Event(event);
                    }
                    if cursor + 1 < floor {
                        debug!(session_id = %session.id(), missing_from = cursor + 1, missing_to = floor - 1, "gap in replay");
                        yield ReplayItem::Gap {
                            missing_from: cursor + 1,
                            missing_to: floor - 1,
                        };
                        cursor = floor - 1;
                    }
                }
                ReadOutcome::Closed => {
                    yield ReplayItem::End;
                    return;
                }
                ReadOutcome::Pending => {}
            }
        }
    })
}

/// Contiguous events after `cursor` and below `floor` that the replica still
/// holds. Stops at the first hole.
fn fill_from_replica(session: &Session, cursor: u64, floor: u64, page_size: usize) -> Vec<Event> {
    let Some(replica) = session.replica() else {
        return Vec::new();
    };
    let page_size = page_size.max(1);
    let mut filled = Vec::new();
    let mut next = cursor + 1;
    while next < floor {
        let page = match replica.events_after(session.id(), next - 1, page_size) {
            Ok(page) => page,
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "replica read failed during gap fill");
                break;
            }
        };
        if page.is_empty() {
            break;
        }
        let before = filled.len();
        for event in page {
            if event.sequence != next || next >= floor {
                break;
            }
            next += 1;
            filled.push(event);
        }
        if filled.len() == before {
            break;
        }
    }
    filled
}

/// Replay a session that only the replica still knows about.
pub fn archived(
    replica: Arc<dyn EventReplica>,
    meta: ReplicaSession,
    since: u64,
    page_size: usize,
) -> ReplayStream {
    let page_size = page_size.max(1);
    Box::pin(async_stream::stream! {
        let session_id = meta.session_id.clone();
        let mut cursor = since;
        loop {
            let page = match replica.events_after(&session_id, cursor, page_size) {
                Ok(page) => page,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "replica read failed during replay");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            for event in page {
                if event.sequence > cursor + 1 {
                    yield ReplayItem::Gap {
                        missing_from: cursor + 1,
                        missing_to: event.sequence - 1,
                    };
                }
                cursor = event.sequence;
                let terminal = event.is_terminal();
                yield ReplayItem::Event(event);
                if terminal {
                    yield ReplayItem::End;
                    return;
                }
            }
        }
        if !meta.state.is_terminal() {
            yield ReplayItem::Interrupted {
                session_id,
                last_sequence: cursor,
            };
        }
        yield ReplayItem::End;
    })
}
