use serde::{Deserialize, Serialize};

/// Lifecycle of a streaming session. Transitions only move forward:
/// `Active -> Finishing -> {Finished | Cancelled | Errored}`, with the
/// producer also allowed to go straight from `Active` to a terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    /// Stop requested; the terminal event has not been written yet.
    Finishing,
    Finished,
    Cancelled,
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Errored)
    }

    /// Whether moving to `next` keeps the state machine monotonic.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        match (self, next) {
            (Self::Active, Self::Active) => false,
            (Self::Active, _) => true,
            (Self::Finishing, s) => s.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Finishing => write!(f, "finishing"),
            Self::Finished => write!(f, "finished"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "finishing" => Ok(Self::Finishing),
            "finished" => Ok(Self::Finished),
            "cancelled" => Ok(Self::Cancelled),
            "errored" => Ok(Self::Errored),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}
