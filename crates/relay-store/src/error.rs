#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },
}

impl StoreError {
    /// Whether the store itself is unusable, as opposed to a data problem.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Io(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_classification() {
        assert!(StoreError::Database("locked".into()).is_unavailable());
        assert!(StoreError::Io("disk full".into()).is_unavailable());
        assert!(!StoreError::Conflict("dup".into()).is_unavailable());
    }

    #[test]
    fn corrupt_row_display() {
        let e = StoreError::CorruptRow {
            table: "stream_events",
            column: "payload",
            detail: "invalid JSON".into(),
        };
        assert_eq!(e.to_string(), "corrupt row in stream_events.payload: invalid JSON");
    }
}
