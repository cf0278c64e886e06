//! Concurrent, back-pressured NATS consumption pipeline.
//!
//! This library turns typed message handlers into subscription processors:
//! each consumer identity gets one listener feeding a bounded work queue
//! and one dispatcher draining it under a degree-of-parallelism limit,
//! with handler outcomes translated into the JetStream acknowledgement
//! protocol (or a core reply). A revisioned KV bucket backs distributed
//! locks with lease renewal and expired-lease stealing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌────────────┐    ┌───────────┐    ┌─────────────┐
//! │ NATS / JS    │───▶│  Listener  │───▶│ WorkQueue │───▶│ Dispatcher  │
//! │ subscription │    │ (matcher)  │    │ (bounded) │    │ (semaphore) │
//! └──────────────┘    └────────────┘    └───────────┘    └─────┬───────┘
//!                                                              │
//!                           Ack / Nak / Term  ◀───────────  Handler
//! ```
//!
//! # Key pieces
//!
//! - [`ConsumerRegistry`]: typed handler registration, grouped by consumer
//!   identity into one [`SubscriptionProcessor`] each
//! - [`SubscriptionProcessor`]: the listener/dispatcher pair for one
//!   consumer identity (durable JetStream or core with queue groups)
//! - [`DistributedLocks`] / [`LockHandle`]: at-most-one-owner locks over a
//!   revisioned KV bucket, with background lease renewal
//! - [`NatsClient`]: the facade bundling connection, publish/subscribe,
//!   consumer mapping, and locks
//!
//! # Example
//!
//! ```rust,ignore
//! use messaging::{ConsumerOptions, HandlerResult, Json, MessageHandler, TypedMessage};
//! use nats_consumer::{ConsumerRegistry, NatsClient, NatsConfig};
//!
//! let client = NatsClient::connect(NatsConfig::new("nats://localhost:4222")).await?;
//!
//! let mut registry = ConsumerRegistry::new();
//! registry.register(
//!     "orders.>",
//!     ConsumerOptions::from_env().with_consumer_id("orders-consumer"),
//!     OrderHandler::new(store),
//! )?;
//!
//! let shutdown = tokio_util::sync::CancellationToken::new();
//! client.map_consumers(registry, shutdown).await?;
//! ```

mod binding;
mod client;
mod error;
pub mod lock;
pub mod metrics;
mod placeholders;
mod processor;
mod registry;

pub use binding::{ConsumerBinding, InvokeError, RawMessage};
pub use client::{NatsClient, NatsConfig};
pub use error::ConsumerError;
pub use lock::{
    DistributedLocks, LockConfig, LockDocument, LockError, LockHandle, LockStatus, LOCK_BUCKET,
};
pub use metrics::{init_metrics, ConsumerMetrics, HandlerStatus};
pub use placeholders::resolve_queue_group;
pub use processor::SubscriptionProcessor;
pub use registry::{ConsumerRegistry, DuplicateSubjectPolicy};

// Re-export the handler contract so depending on `messaging` directly is
// optional for consumers of this crate.
pub use messaging::{
    ConsumerOptions, ErrorCategory, HandlerError, HandlerResult, Json, MessageHandler, Payload,
    SubjectMatcher, TypedMessage, WorkQueue,
};
