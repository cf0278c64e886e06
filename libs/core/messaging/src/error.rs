//! Error types for message handling.

use std::fmt;
use thiserror::Error;

/// Error categories determine what the dispatcher reports for a failed
/// handler invocation.
///
/// A transient failure is expected to succeed on redelivery; a permanent
/// failure will not, no matter how often the message comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure (network timeout, downstream unavailable)
    Transient,

    /// Unrecoverable failure (invalid data, violated business rule)
    Permanent,
}

impl ErrorCategory {
    /// Whether a redelivery has a chance of succeeding.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
        }
    }
}

/// Error returned by a message handler.
///
/// Handlers that complete normally describe the acknowledgement outcome via
/// [`crate::HandlerResult`]; this type is for the cases where the handler
/// itself fails. The category only affects reporting — a failed invocation
/// is never acknowledged, so the broker redelivers per its own policy.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient handler failure
    #[error("transient handler error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Permanent handler failure
    #[error("permanent handler error: {message}")]
    Permanent {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl HandlerError {
    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient error with a source.
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            source: None,
        }
    }

    /// Create a permanent error with a source.
    pub fn permanent_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Permanent {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            HandlerError::Transient { .. } => ErrorCategory::Transient,
            HandlerError::Permanent { .. } => ErrorCategory::Permanent,
        }
    }

    /// Whether a redelivery has a chance of succeeding.
    pub fn retryable(&self) -> bool {
        self.category().retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_retryable() {
        assert!(ErrorCategory::Transient.retryable());
        assert!(!ErrorCategory::Permanent.retryable());
    }

    #[test]
    fn test_handler_error_category() {
        let transient = HandlerError::transient("network timeout");
        assert_eq!(transient.category(), ErrorCategory::Transient);
        assert!(transient.retryable());

        let permanent = HandlerError::permanent("invalid order id");
        assert_eq!(permanent.category(), ErrorCategory::Permanent);
        assert!(!permanent.retryable());
    }

    #[test]
    fn test_handler_error_source() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = HandlerError::transient_with_source("downstream call failed", io);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("downstream call failed"));
    }
}
