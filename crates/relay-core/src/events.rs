use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// One sequenced unit of a session's stream. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub session_id: SessionId,
    /// 1-based, strictly increasing per session.
    pub sequence: u64,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(session_id: SessionId, sequence: u64, payload: Payload) -> Self {
        Self {
            session_id,
            sequence,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }

    /// The `<session_id>:<sequence>` form clients echo back to resume.
    pub fn cursor(&self) -> String {
        format!("{}:{}", self.session_id, self.sequence)
    }
}

/// What an event carries. `Done` and `Error` are terminal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Data { text: String },
    Done { finish_reason: FinishReason },
    Error { error: ErrorDescriptor },
}

impl Payload {
    pub fn data(text: impl Into<String>) -> Self {
        Self::Data { text: text.into() }
    }

    pub fn done(finish_reason: FinishReason) -> Self {
        Self::Done { finish_reason }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data { .. } => EventKind::Data,
            Self::Done { .. } => EventKind::Done,
            Self::Error { .. } => EventKind::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Data,
    Done,
    Error,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data" => Ok(Self::Data),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Cancelled,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Machine-readable kind plus a human-readable reason.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
}
