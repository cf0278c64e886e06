//! Consumer configuration.

use std::env;
use std::time::Duration;
use tracing::warn;

/// Environment variable bounding the per-processor work queue.
pub const QUEUE_CAPACITY_ENV: &str = "NATS_SUBSCRIPTION_QUEUE_SIZE";

/// Environment variable bounding the degree of parallelism.
pub const MAX_DOP_ENV: &str = "NATS_CONSUMER_MAX_DOP";

/// Default work queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 20_000;

/// Default degree of parallelism.
pub const DEFAULT_MAX_DOP: usize = 128;

/// Default idle timeout between items of one batch read.
pub const DEFAULT_BATCH_IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Options for one consumer registration.
///
/// A supplied `consumer_id` makes the binding durable (JetStream); without
/// one the binding runs over a plain core subscription and the framework
/// synthesizes an identity from subject and queue group.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Durable consumer id. Presence implies JetStream mode.
    pub consumer_id: Option<String>,

    /// Queue group name; meaningful only in core mode. May contain
    /// placeholders that are resolved at listener startup.
    pub queue_group: Option<String>,

    /// Maximum number of concurrently running handler invocations.
    pub max_dop: usize,

    /// Whether the dispatcher drains the queue in batches of `max_dop`
    /// rather than one item at a time.
    pub batching: bool,

    /// Idle timeout between items of one batch read.
    pub batch_idle_timeout: Duration,

    /// Capacity of the bounded work queue feeding the dispatcher.
    pub queue_capacity: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            consumer_id: None,
            queue_group: None,
            max_dop: DEFAULT_MAX_DOP,
            batching: true,
            batch_idle_timeout: DEFAULT_BATCH_IDLE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ConsumerOptions {
    /// Defaults with the queue capacity and parallelism limits taken from
    /// the environment.
    pub fn from_env() -> Self {
        Self {
            max_dop: env_usize(MAX_DOP_ENV, DEFAULT_MAX_DOP),
            queue_capacity: env_usize(QUEUE_CAPACITY_ENV, DEFAULT_QUEUE_CAPACITY),
            ..Default::default()
        }
    }

    /// Set the durable consumer id.
    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = Some(id.into());
        self
    }

    /// Set the queue group name.
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    /// Set the maximum degree of parallelism.
    pub fn with_max_dop(mut self, max_dop: usize) -> Self {
        self.max_dop = max_dop.max(1);
        self
    }

    /// Enable or disable batched queue reads.
    pub fn with_batching(mut self, batching: bool) -> Self {
        self.batching = batching;
        self
    }

    /// Set the idle timeout between items of one batch read.
    pub fn with_batch_idle_timeout(mut self, timeout: Duration) -> Self {
        self.batch_idle_timeout = timeout;
        self
    }

    /// Set the work queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Whether this registration targets a durable JetStream consumer.
    pub fn durable(&self) -> bool {
        self.consumer_id.is_some()
    }
}

/// Read a `usize` environment variable, falling back to the default on
/// absence or parse failure.
fn env_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, default, "Unparseable environment variable, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConsumerOptions::default();
        assert!(options.consumer_id.is_none());
        assert!(!options.durable());
        assert_eq!(options.max_dop, DEFAULT_MAX_DOP);
        assert_eq!(options.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(options.batching);
    }

    #[test]
    fn test_builder() {
        let options = ConsumerOptions::default()
            .with_consumer_id("orders-consumer")
            .with_queue_group("pod-{POD_NAME}")
            .with_max_dop(16)
            .with_batching(false)
            .with_batch_idle_timeout(Duration::from_millis(25))
            .with_queue_capacity(512);

        assert!(options.durable());
        assert_eq!(options.consumer_id.as_deref(), Some("orders-consumer"));
        assert_eq!(options.queue_group.as_deref(), Some("pod-{POD_NAME}"));
        assert_eq!(options.max_dop, 16);
        assert!(!options.batching);
        assert_eq!(options.batch_idle_timeout, Duration::from_millis(25));
        assert_eq!(options.queue_capacity, 512);
    }

    #[test]
    fn test_limits_clamped() {
        let options = ConsumerOptions::default()
            .with_max_dop(0)
            .with_queue_capacity(0);
        assert_eq!(options.max_dop, 1);
        assert_eq!(options.queue_capacity, 1);
    }

    #[test]
    fn test_env_usize_parsing() {
        let key = "MESSAGING_TEST_ENV_USIZE";
        std::env::remove_var(key);
        assert_eq!(env_usize(key, 7), 7);

        std::env::set_var(key, "42");
        assert_eq!(env_usize(key, 7), 42);

        std::env::set_var(key, "not-a-number");
        assert_eq!(env_usize(key, 7), 7);

        std::env::remove_var(key);
    }
}
