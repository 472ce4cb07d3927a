use serde::{Deserialize, Serialize};

/// Coarse classification callers map to user-facing responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    InsufficientPoints,
    Busy,
    StorageFailure,
    Cancelled,
    Configuration,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::InsufficientPoints => "insufficient_points",
            Self::Busy => "busy",
            Self::StorageFailure => "storage_failure",
            Self::Cancelled => "cancelled",
            Self::Configuration => "configuration",
        }
    }

    /// Whether a caller may retry the same request later with backoff.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Busy | Self::StorageFailure)
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("invalid category: {0}")]
    InvalidCategory(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("insufficient points: requested {requested}, available {available}")]
    InsufficientPoints { requested: i64, available: i64 },
    #[error("ledger busy: {0}")]
    Busy(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("operation cancelled before commit")]
    Cancelled,
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl LedgerError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCategory(_) | Self::InvalidAmount(_) | Self::InvalidInput(_) => {
                ErrorKind::InvalidInput
            }
            Self::InsufficientPoints { .. } => ErrorKind::InsufficientPoints,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Storage(_) => ErrorKind::StorageFailure,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_variants_share_invalid_input_kind() {
        for err in [
            LedgerError::InvalidCategory("toys".to_string()),
            LedgerError::InvalidAmount("-1".to_string()),
            LedgerError::InvalidInput("blank reference".to_string()),
        ] {
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn busy_and_storage_are_retryable() {
        assert!(LedgerError::Busy("lock wait".to_string()).is_retryable());
        assert!(LedgerError::Storage("disk".to_string()).is_retryable());
        assert!(!LedgerError::InsufficientPoints {
            requested: 10,
            available: 5
        }
        .is_retryable());
    }

    #[test]
    fn insufficient_points_message_carries_amounts() {
        let err = LedgerError::InsufficientPoints {
            requested: 60,
            available: 50,
        };
        assert_eq!(
            err.to_string(),
            "insufficient points: requested 60, available 50"
        );
        assert_eq!(err.kind().as_str(), "insufficient_points");
    }
}
