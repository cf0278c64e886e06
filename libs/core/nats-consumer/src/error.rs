//! Error types for the NATS consumption pipeline.

use messaging::QueueError;
use thiserror::Error;

/// Error that can occur while wiring or running consumers.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// NATS connection error
    #[error("NATS connection error: {0}")]
    Connection(#[from] async_nats::ConnectError),

    /// Core subscription error
    #[error("subscribe error: {0}")]
    Subscribe(#[from] async_nats::SubscribeError),

    /// JetStream operation error
    #[error("JetStream error: {0}")]
    JetStream(String),

    /// Publish error
    #[error("publish error: {0}")]
    Publish(String),

    /// Request-reply error
    #[error("request error: {0}")]
    Request(String),

    /// Configuration error (bad binding, invalid subject, missing id)
    #[error("configuration error: {0}")]
    Config(String),

    /// A subject pattern was registered twice under the fail-fast policy
    #[error("duplicate subject binding: {0}")]
    DuplicateBinding(String),

    /// No stream captures a durably bound subject
    #[error("no stream captures subject '{subject}'")]
    StreamNotFound { subject: String },

    /// More than one stream captures a durably bound subject
    #[error("multiple streams capture subject '{subject}': {matches:?}")]
    AmbiguousStream {
        subject: String,
        matches: Vec<String>,
    },

    /// The durable consumer does not exist on the resolved stream
    #[error("durable consumer '{consumer}' not found on stream '{stream}': {reason}")]
    ConsumerNotFound {
        consumer: String,
        stream: String,
        reason: String,
    },

    /// The underlying subscription ended while the processor was running
    #[error("subscription closed unexpectedly")]
    SubscriptionClosed,

    /// A listener or dispatcher task ended abnormally (panic or abort)
    #[error("processor task failed: {0}")]
    TaskFailed(String),

    /// Work queue failure
    #[error("work queue error: {0}")]
    Queue(#[from] QueueError),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key-value bucket error
    #[error("key-value error: {0}")]
    KeyValue(String),

    /// Distributed lock error
    #[error(transparent)]
    Lock(#[from] crate::lock::LockError),
}

impl ConsumerError {
    /// Create a JetStream error from any displayable error.
    pub fn jetstream(error: impl std::fmt::Display) -> Self {
        Self::JetStream(error.to_string())
    }

    /// Create a publish error.
    pub fn publish(error: impl std::fmt::Display) -> Self {
        Self::Publish(error.to_string())
    }

    /// Create a request error.
    pub fn request(error: impl std::fmt::Display) -> Self {
        Self::Request(error.to_string())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a key-value error.
    pub fn key_value(error: impl std::fmt::Display) -> Self {
        Self::KeyValue(error.to_string())
    }

    /// Whether this error is a deployment-time configuration mistake (bad
    /// binding, unresolvable stream, missing durable consumer) rather than
    /// a runtime transport condition.
    ///
    /// Both kinds abort the process when they fault a running processor
    /// (see `NatsClient::map_consumers`); this distinction exists for
    /// bootstrap code that wants to report them differently.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsumerError::Config(_)
                | ConsumerError::DuplicateBinding(_)
                | ConsumerError::StreamNotFound { .. }
                | ConsumerError::AmbiguousStream { .. }
                | ConsumerError::ConsumerNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ConsumerError::config("bad binding").is_fatal());
        assert!(ConsumerError::DuplicateBinding("a.b".into()).is_fatal());
        assert!(ConsumerError::AmbiguousStream {
            subject: "a.>".into(),
            matches: vec!["S1".into(), "S2".into()],
        }
        .is_fatal());
        assert!(!ConsumerError::SubscriptionClosed.is_fatal());
        assert!(!ConsumerError::Queue(QueueError::Cancelled).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = ConsumerError::StreamNotFound {
            subject: "evt.>".into(),
        };
        assert!(err.to_string().contains("evt.>"));

        let err = ConsumerError::jetstream("broken pipe");
        assert!(err.to_string().contains("broken pipe"));
    }
}
