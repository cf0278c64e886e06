//! Backend-agnostic messaging abstractions for subscription pipelines.
//!
//! This library holds everything a consumption pipeline needs that does not
//! touch a broker:
//!
//! - **Handler contract**: the [`MessageHandler`] trait, the typed message
//!   wrapper, and the acknowledgement outcome a handler reports
//! - **Payload codec**: decoding opaque wire bytes by the handler's declared
//!   payload type
//! - **Bounded work queue**: the back-pressure point between a listener and
//!   its dispatcher, with a batching read
//! - **Subject matcher**: a wildcard-aware trie resolving a concrete subject
//!   to the most specific registered pattern
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐     ┌─────────────┐     ┌──────────────┐     ┌───────────┐
//! │  Listener  │────▶│  WorkQueue  │────▶│  Dispatcher  │────▶│  Handler  │
//! │ (backend)  │     │  (bounded)  │     │ (semaphore)  │     │ (yours)   │
//! └────────────┘     └─────────────┘     └──────────────┘     └───────────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌────────────────┐                    ┌─────────────────┐
//! │ SubjectMatcher │                    │  HandlerResult  │
//! │ (routing)      │                    │  (ack protocol) │
//! └────────────────┘                    └─────────────────┘
//! ```
//!
//! The NATS binding lives in the `nats-consumer` crate.

mod config;
mod error;
mod handler;
mod payload;
mod queue;
mod subject;

pub use config::{
    ConsumerOptions, DEFAULT_BATCH_IDLE_TIMEOUT, DEFAULT_MAX_DOP, DEFAULT_QUEUE_CAPACITY,
    MAX_DOP_ENV, QUEUE_CAPACITY_ENV,
};
pub use error::{ErrorCategory, HandlerError};
pub use handler::{HandlerResult, MessageHandler, TypedMessage};
pub use payload::{DecodeError, Json, Payload};
pub use queue::{QueueError, WorkQueue};
pub use subject::{SubjectMatcher, TAIL_WILDCARD, TOKEN_WILDCARD};
