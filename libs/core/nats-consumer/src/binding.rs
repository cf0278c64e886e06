//! Consumer bindings: one subject pattern wired to one typed handler.
//!
//! A binding erases the handler's payload type behind an adapter so the
//! processor can treat every handler uniformly: the adapter decodes the raw
//! payload into the declared type and invokes the handler, and the
//! processor translates the outcome into the acknowledgement protocol.

use bytes::Bytes;
use futures::future::BoxFuture;
use messaging::{DecodeError, HandlerError, HandlerResult, MessageHandler, Payload, TypedMessage};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A raw message as handed from the listener to the dispatcher.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Concrete subject the message arrived on.
    pub subject: String,

    /// Undecoded payload bytes.
    pub payload: Bytes,

    /// Reply subject, when present (core NATS).
    pub reply: Option<String>,

    /// Delivery attempt count (1 = first delivery).
    pub delivery_count: u64,
}

/// Why an invocation did not produce a [`HandlerResult`].
///
/// Decode failures and handler failures are treated differently by the
/// dispatcher: a decode failure is logged with a payload preview and the
/// message is skipped, a handler failure is recorded as a failed-retryable
/// invocation.
#[derive(Debug)]
pub enum InvokeError {
    /// The payload did not decode into the handler's declared type.
    Decode(DecodeError),

    /// The handler itself failed.
    Handler(HandlerError),
}

trait ErasedHandler: Send + Sync {
    fn handler_name(&self) -> &'static str;

    fn payload_type(&self) -> &'static str;

    fn invoke(
        &self,
        raw: RawMessage,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<HandlerResult, InvokeError>>;
}

struct HandlerAdapter<H: MessageHandler> {
    handler: Arc<H>,
}

impl<H: MessageHandler> ErasedHandler for HandlerAdapter<H> {
    fn handler_name(&self) -> &'static str {
        self.handler.name()
    }

    fn payload_type(&self) -> &'static str {
        H::Payload::type_label()
    }

    fn invoke(
        &self,
        raw: RawMessage,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<HandlerResult, InvokeError>> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let payload = H::Payload::decode(&raw.payload).map_err(InvokeError::Decode)?;
            let message = TypedMessage {
                subject: raw.subject,
                payload,
                reply: raw.reply,
                delivery_count: raw.delivery_count,
            };
            handler
                .handle(message, cancel)
                .await
                .map_err(InvokeError::Handler)
        })
    }
}

/// One subject pattern bound to one handler under a consumer identity.
#[derive(Clone)]
pub struct ConsumerBinding {
    subject: String,
    consumer_id: Option<String>,
    queue_group: Option<String>,
    durable: bool,
    handler: Arc<dyn ErasedHandler>,
}

impl ConsumerBinding {
    /// Create a binding for a typed handler.
    pub fn new<H: MessageHandler>(
        subject: impl Into<String>,
        consumer_id: Option<String>,
        queue_group: Option<String>,
        handler: H,
    ) -> Self {
        let durable = consumer_id.is_some();
        Self {
            subject: subject.into(),
            consumer_id,
            queue_group,
            durable,
            handler: Arc::new(HandlerAdapter {
                handler: Arc::new(handler),
            }),
        }
    }

    /// The bound subject pattern.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The explicit consumer id, when one was supplied.
    pub fn consumer_id(&self) -> Option<&str> {
        self.consumer_id.as_deref()
    }

    /// The queue group name, with placeholders unresolved.
    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    /// Whether this binding attaches to a durable JetStream consumer.
    pub fn durable(&self) -> bool {
        self.durable
    }

    /// The consumer identity this binding groups under. Without an explicit
    /// id a non-durable identity is synthesized from subject and queue
    /// group.
    pub fn effective_consumer_id(&self) -> String {
        match &self.consumer_id {
            Some(id) => id.clone(),
            None => format!(
                "{}-{}",
                self.subject,
                self.queue_group.as_deref().unwrap_or_default()
            ),
        }
    }

    /// Identifier of the bound handler for logs and metrics.
    pub fn handler_name(&self) -> &'static str {
        self.handler.handler_name()
    }

    /// Label of the payload type the handler declares.
    pub fn payload_type(&self) -> &'static str {
        self.handler.payload_type()
    }

    /// Decode the raw payload and invoke the handler.
    pub fn invoke(
        &self,
        raw: RawMessage,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<HandlerResult, InvokeError>> {
        self.handler.invoke(raw, cancel)
    }
}

impl std::fmt::Debug for ConsumerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerBinding")
            .field("subject", &self.subject)
            .field("consumer_id", &self.consumer_id)
            .field("queue_group", &self.queue_group)
            .field("durable", &self.durable)
            .field("handler", &self.handler_name())
            .field("payload_type", &self.payload_type())
            .finish()
    }
}
