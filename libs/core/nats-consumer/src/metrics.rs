//! Prometheus metrics for subscription processors.

use messaging::ErrorCategory;
use metrics::{counter, histogram};
use std::time::Duration;

/// Outcome label recorded for a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// Handler returned an acknowledged result.
    Ack,
    /// Handler asked for redelivery.
    Retry,
    /// Handler gave up on the message.
    Terminate,
    /// Handler failed.
    Fail,
}

impl HandlerStatus {
    fn as_str(&self) -> &'static str {
        match self {
            HandlerStatus::Ack => "ack",
            HandlerStatus::Retry => "retry",
            HandlerStatus::Terminate => "terminate",
            HandlerStatus::Fail => "fail",
        }
    }
}

/// Metrics recorder for one consumer identity.
#[derive(Clone)]
pub struct ConsumerMetrics {
    consumer_id: String,
}

impl ConsumerMetrics {
    /// Create a recorder labeled with the consumer id.
    pub fn new(consumer_id: &str) -> Self {
        Self {
            consumer_id: consumer_id.to_string(),
        }
    }

    /// Record a message pulled off the subscription.
    pub fn message_received(&self) {
        counter!(
            "nats_consumer_messages_received_total",
            "consumer" => self.consumer_id.clone()
        )
        .increment(1);
    }

    /// Record a completed handler invocation with its elapsed time.
    pub fn handler_completed(&self, handler: &'static str, status: HandlerStatus, elapsed: Duration) {
        counter!(
            "nats_consumer_handler_invocations_total",
            "consumer" => self.consumer_id.clone(),
            "handler" => handler,
            "status" => status.as_str()
        )
        .increment(1);

        histogram!(
            "nats_consumer_handler_duration_seconds",
            "consumer" => self.consumer_id.clone(),
            "handler" => handler
        )
        .record(elapsed.as_secs_f64());
    }

    /// Record a failed handler invocation.
    pub fn handler_failed(
        &self,
        handler: &'static str,
        category: ErrorCategory,
        elapsed: Duration,
    ) {
        counter!(
            "nats_consumer_handler_failures_total",
            "consumer" => self.consumer_id.clone(),
            "handler" => handler,
            "retryable" => if category.retryable() { "true" } else { "false" }
        )
        .increment(1);

        self.handler_completed(handler, HandlerStatus::Fail, elapsed);
    }

    /// Record a message whose subject matched no binding.
    pub fn subject_match_miss(&self) {
        counter!(
            "nats_consumer_subject_match_misses_total",
            "consumer" => self.consumer_id.clone()
        )
        .increment(1);
    }

    /// Record a payload that failed to decode.
    pub fn decode_failed(&self, handler: &'static str) {
        counter!(
            "nats_consumer_decode_failures_total",
            "consumer" => self.consumer_id.clone(),
            "handler" => handler
        )
        .increment(1);
    }
}

/// Initialize the Prometheus metrics recorder.
pub fn init_metrics() -> metrics_exporter_prometheus::PrometheusHandle {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    builder
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_labels() {
        assert_eq!(HandlerStatus::Ack.as_str(), "ack");
        assert_eq!(HandlerStatus::Retry.as_str(), "retry");
        assert_eq!(HandlerStatus::Terminate.as_str(), "terminate");
        assert_eq!(HandlerStatus::Fail.as_str(), "fail");
    }

    #[test]
    fn test_recording_without_recorder_is_a_noop() {
        // The metrics facade silently drops events when no recorder is
        // installed, so recording must never panic.
        let metrics = ConsumerMetrics::new("test-consumer");
        metrics.message_received();
        metrics.handler_completed("h", HandlerStatus::Ack, Duration::from_millis(3));
        metrics.handler_failed("h", ErrorCategory::Transient, Duration::from_millis(3));
        metrics.subject_match_miss();
        metrics.decode_failed("h");
    }
}
