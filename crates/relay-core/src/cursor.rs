use std::fmt;
use std::str::FromStr;

use crate::ids::{SessionId, SessionIdError};

/// Opaque resume token of the form `<session_id>:<sequence>`, where `sequence`
/// is the last event the client has seen (0 = nothing seen yet).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeCursor {
    pub session_id: SessionId,
    pub sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    #[error("cursor {0:?} is not of the form <session_id>:<sequence>")]
    Malformed(String),
    #[error("cursor session id is invalid: {0}")]
    InvalidSessionId(#[from] SessionIdError),
    #[error("cursor sequence {0:?} is not a non-negative integer")]
    InvalidSequence(String),
}

impl ResumeCursor {
    pub fn new(session_id: SessionId, sequence: u64) -> Self {
        Self {
            session_id,
            sequence,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CursorError> {
        let raw = raw.trim();
        let (sid, seq) = raw
            .rsplit_once(':')
            .ok_or_else(|| CursorError::Malformed(raw.to_string()))?;
        let session_id = SessionId::parse(sid)?;
        let sequence = seq
            .parse::<u64>()
            .map_err(|_| CursorError::InvalidSequence(seq.to_string()))?;
        Ok(Self {
            session_id,
            sequence,
        })
    }
}

impl FromStr for ResumeCursor {
    type Err = CursorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ResumeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_valid_cursor() {
        let c = ResumeCursor::parse("s1:17").unwrap();
        assert_eq!(c.session_id.as_str(), "s1");
        assert_eq!(c.sequence, 17);
        assert_eq!(c.to_string(), "s1:17");
    }

    #[test]
    fn zero_means_from_start() {
        let c: ResumeCursor = "done-session:0".parse().unwrap();
        assert_eq!(c.sequence, 0);
    }

    #[test]
    fn trims_whitespace() {
        let c = ResumeCursor::parse("  s1:3 ").unwrap();
        assert_eq!(c.sequence, 3);
    }

    #[test]
    fn rejects_missing_delimiter() {
        assert_matches!(ResumeCursor::parse("s1"), Err(CursorError::Malformed(_)));
    }

    #[test]
    fn rejects_negative_or_garbage_sequence() {
        assert_matches!(ResumeCursor::parse("s1:-1"), Err(CursorError::InvalidSequence(_)));
        assert_matches!(ResumeCursor::parse("s1:abc"), Err(CursorError::InvalidSequence(_)));
        assert_matches!(ResumeCursor::parse("s1:"), Err(CursorError::InvalidSequence(_)));
    }

    #[test]
    fn rejects_bad_session_id() {
        assert_matches!(
            ResumeCursor::parse(":5"),
            Err(CursorError::InvalidSessionId(SessionIdError::Empty))
        );
        assert_matches!(
            ResumeCursor::parse("a:b:5"),
            Err(CursorError::InvalidSessionId(SessionIdError::InvalidChar(':')))
        );
    }
}
