//! Handler trait and acknowledgement contract.

use crate::error::HandlerError;
use crate::payload::Payload;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A typed message delivered to a handler.
///
/// Wraps the decoded payload with the delivery metadata a handler may care
/// about. The raw wire bytes never reach the handler; decoding happens in
/// the dispatcher according to the handler's declared payload type.
#[derive(Debug, Clone)]
pub struct TypedMessage<T> {
    /// Concrete subject the message arrived on.
    pub subject: String,

    /// Decoded payload.
    pub payload: T,

    /// Reply subject, when the sender expects a response (core NATS only).
    pub reply: Option<String>,

    /// Number of times this message has been delivered (1 = first delivery).
    pub delivery_count: u64,
}

impl<T> TypedMessage<T> {
    /// Create a first-delivery message.
    pub fn new(subject: impl Into<String>, payload: T) -> Self {
        Self {
            subject: subject.into(),
            payload,
            reply: None,
            delivery_count: 1,
        }
    }

    /// Check if this is a redelivery.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Take ownership of the payload.
    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// Outcome of a successful handler invocation.
///
/// The dispatcher translates this into the broker protocol: on JetStream an
/// acknowledged result is acked, an unacknowledged one is either nak'd
/// (retry) or terminated (no redelivery); on core NATS nothing is acked and
/// an optional reply is published.
#[derive(Debug, Clone, Default)]
pub struct HandlerResult {
    /// Whether processing succeeded and the message should be acknowledged.
    pub acknowledged: bool,

    /// When not acknowledged, whether the broker should redeliver.
    /// Ignored when `acknowledged` is true.
    pub should_retry: bool,

    /// Optional reply payload, sent when the message carried a reply subject.
    pub reply: Option<Bytes>,

    /// Optional redelivery delay attached to a retry (JetStream NAK delay).
    pub retry_delay: Option<Duration>,
}

impl HandlerResult {
    /// Acknowledge the message.
    pub fn ack() -> Self {
        Self {
            acknowledged: true,
            ..Default::default()
        }
    }

    /// Request redelivery.
    pub fn retry() -> Self {
        Self {
            should_retry: true,
            ..Default::default()
        }
    }

    /// Request redelivery after a delay.
    pub fn retry_after(delay: Duration) -> Self {
        Self {
            should_retry: true,
            retry_delay: Some(delay),
            ..Default::default()
        }
    }

    /// Give up on the message: no acknowledgement, no redelivery.
    pub fn terminate() -> Self {
        Self::default()
    }

    /// Attach a reply payload.
    pub fn with_reply(mut self, reply: impl Into<Bytes>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

/// A message handler bound to a subject.
///
/// The payload type is part of the handler's signature; the framework
/// decodes the wire bytes into it before invoking [`handle`]. The
/// cancellation token fires when the owning processor shuts down — long
/// handlers should observe it.
///
/// [`handle`]: MessageHandler::handle
///
/// # Example
///
/// ```rust,ignore
/// struct OrderHandler {
///     store: Arc<OrderStore>,
/// }
///
/// #[async_trait]
/// impl MessageHandler for OrderHandler {
///     type Payload = Json<OrderPlaced>;
///
///     async fn handle(
///         &self,
///         message: TypedMessage<Json<OrderPlaced>>,
///         _cancel: CancellationToken,
///     ) -> Result<HandlerResult, HandlerError> {
///         self.store
///             .record(&message.payload)
///             .await
///             .map_err(|e| HandlerError::transient_with_source("store write failed", e))?;
///         Ok(HandlerResult::ack())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// The decoded payload type this handler expects.
    type Payload: Payload;

    /// Handle one delivered message.
    async fn handle(
        &self,
        message: TypedMessage<Self::Payload>,
        cancel: CancellationToken,
    ) -> Result<HandlerResult, HandlerError>;

    /// Identifier used in logs and metrics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_ack() {
        let r = HandlerResult::ack();
        assert!(r.acknowledged);
        assert!(!r.should_retry);
        assert!(r.reply.is_none());
    }

    #[test]
    fn test_result_retry() {
        let r = HandlerResult::retry();
        assert!(!r.acknowledged);
        assert!(r.should_retry);
        assert!(r.retry_delay.is_none());

        let delayed = HandlerResult::retry_after(Duration::from_secs(5));
        assert!(delayed.should_retry);
        assert_eq!(delayed.retry_delay, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_result_terminate() {
        let r = HandlerResult::terminate();
        assert!(!r.acknowledged);
        assert!(!r.should_retry);
    }

    #[test]
    fn test_result_with_reply() {
        let r = HandlerResult::ack().with_reply("pong".as_bytes().to_vec());
        assert_eq!(r.reply, Some(Bytes::from_static(b"pong")));
    }

    #[test]
    fn test_typed_message_redelivery() {
        let mut msg = TypedMessage::new("orders.created", 7i64);
        assert!(!msg.is_redelivery());
        msg.delivery_count = 3;
        assert!(msg.is_redelivery());
        assert_eq!(msg.into_payload(), 7);
    }

    #[tokio::test]
    async fn test_handler_trait_object() {
        struct Echo;

        #[async_trait]
        impl MessageHandler for Echo {
            type Payload = String;

            async fn handle(
                &self,
                message: TypedMessage<String>,
                _cancel: CancellationToken,
            ) -> Result<HandlerResult, HandlerError> {
                Ok(HandlerResult::ack().with_reply(message.payload.into_bytes()))
            }
        }

        let handler = Echo;
        let msg = TypedMessage::new("echo.in", "hi".to_string());
        let result = handler.handle(msg, CancellationToken::new()).await.unwrap();
        assert_eq!(result.reply, Some(Bytes::from_static(b"hi")));
        assert!(handler.name().contains("Echo"));
    }
}
