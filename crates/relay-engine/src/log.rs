use std::collections::VecDeque;

use relay_core::{Event, Payload, SessionId};

/// What a reader gets back for a given cursor.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadOutcome {
    /// Every retained event after the cursor, in order.
    Events(Vec<Event>),
    /// Events between the cursor and `floor` were evicted.
    Gap { floor: u64 },
    /// Caught up; more may arrive.
    Pending,
    /// Caught up and the terminal event has already been read.
    Closed,
}

#[derive(Debug, thiserror::Error)]
#[error("log is sealed at sequence {head}")]
pub struct LogSealed {
    pub head: u64,
}

/// Bounded per-session event log.
///
/// Holds the newest `capacity` events. Sequences in `[floor, head]` are always
/// present without holes; an empty log reports `floor == head + 1`. A terminal
/// payload seals the log.
#[derive(Debug)]
pub struct SequencedLog {
    capacity: usize,
    events: VecDeque<Event>,
    head: u64,
    sealed: bool,
}

impl SequencedLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity.min(1024)),
            head: 0,
            sealed: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn floor(&self) -> u64 {
        self.events
            .front()
            .map(|e| e.sequence)
            .unwrap_or(self.head + 1)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Sequence the next append will receive.
    pub fn next_sequence(&self) -> Result<u64, LogSealed> {
        if self.sealed {
            return Err(LogSealed { head: self.head });
        }
        Ok(self.head + 1)
    }

    /// Assign the next sequence to `payload` and store it.
    pub fn append(&mut self, session_id: &SessionId, payload: Payload) -> Result<Event, LogSealed> {
        let sequence = self.next_sequence()?;
        let event = Event::new(session_id.clone(), sequence, payload);
        self.push(event.clone())?;
        Ok(event)
    }

    /// Store an event whose sequence was reserved with [`next_sequence`](Self::next_sequence).
    pub fn push(&mut self, event: Event) -> Result<(), LogSealed> {
        let expected = self.next_sequence()?;
        debug_assert_eq!(event.sequence, expected, "sequence must be head + 1");
        self.sealed = event.is_terminal();
        self.head = expected;
        self.events.push_back(Event {
            sequence: expected,
            ..event
        });
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        Ok(())
    }

    /// Events after `since` (the last sequence the reader has seen).
    pub fn read_from(&self, since: u64) -> ReadOutcome {
        let floor = self.floor();
        if since.saturating_add(1) < floor {
            return ReadOutcome::Gap { floor };
        }
        if since < self.head {
            let skip = usize::try_from(since + 1 - floor).unwrap_or(usize::MAX);
            return ReadOutcome::Events(self.events.iter().skip(skip).cloned().collect());
        }
        if self.sealed {
            ReadOutcome::Closed
        } else {
            ReadOutcome::Pending
        }
    }
}
