//! Subscription processor: one consumer identity, one listener, one
//! dispatcher.
//!
//! The listener pulls raw messages off the subscription, resolves each
//! subject against the registered bindings, and enqueues work items into a
//! bounded queue. The dispatcher drains that queue in batches and runs
//! handlers concurrently under a semaphore, then translates each outcome
//! into the acknowledgement protocol. The queue provides back-pressure,
//! the semaphore bounds parallelism; both are needed.

use crate::binding::{ConsumerBinding, InvokeError, RawMessage};
use crate::error::ConsumerError;
use crate::metrics::{ConsumerMetrics, HandlerStatus};
use crate::placeholders::resolve_queue_group;
use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use futures::stream::{self, StreamExt};
use messaging::{ConsumerOptions, HandlerResult, QueueError, SubjectMatcher, WorkQueue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Back-off after a transient dispatcher loop failure.
const TRANSIENT_BACKOFF: Duration = Duration::from_secs(1);

/// Bytes of payload included when logging a decode failure.
const PAYLOAD_PREVIEW_LIMIT: usize = 64;

/// Processes one NATS subscription on behalf of one consumer identity.
pub struct SubscriptionProcessor {
    inner: Arc<Inner>,
}

struct Inner {
    consumer_id: String,
    durable: bool,
    options: ConsumerOptions,
    bindings: Vec<Arc<ConsumerBinding>>,
    by_subject: HashMap<String, Arc<ConsumerBinding>>,
    matcher: SubjectMatcher,
    queue: WorkQueue<WorkItem>,
    client: async_nats::Client,
    jetstream: jetstream::Context,
    metrics: ConsumerMetrics,
}

struct WorkItem {
    binding: Arc<ConsumerBinding>,
    raw: RawMessage,
    ack: AckChannel,
}

enum AckChannel {
    /// JetStream delivery; the message must be acked, nak'd, or terminated.
    JetStream(jetstream::Message),
    /// Core delivery; nothing is acked, an optional reply is published.
    Core,
}

/// What the dispatcher tells JetStream about a completed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckDecision {
    Ack,
    Term,
    Nak(Option<Duration>),
}

fn ack_decision(result: &HandlerResult) -> AckDecision {
    if result.acknowledged {
        AckDecision::Ack
    } else if result.should_retry {
        AckDecision::Nak(result.retry_delay)
    } else {
        AckDecision::Term
    }
}

impl SubscriptionProcessor {
    /// Build a processor for a group of bindings sharing one consumer
    /// identity.
    ///
    /// Fails fast on configuration mistakes: an empty group, mixed
    /// durability, or more than one binding in core mode.
    pub fn new(
        client: async_nats::Client,
        consumer_id: impl Into<String>,
        options: ConsumerOptions,
        bindings: Vec<ConsumerBinding>,
    ) -> Result<Self, ConsumerError> {
        let consumer_id = consumer_id.into();
        if bindings.is_empty() {
            return Err(ConsumerError::config(format!(
                "consumer '{consumer_id}' has no bindings"
            )));
        }

        let durable = bindings[0].durable();
        if bindings.iter().any(|binding| binding.durable() != durable) {
            return Err(ConsumerError::config(format!(
                "consumer '{consumer_id}' mixes durable and non-durable bindings"
            )));
        }
        if !durable && bindings.len() > 1 {
            return Err(ConsumerError::config(format!(
                "consumer '{consumer_id}' is non-durable and must have exactly one binding"
            )));
        }

        let mut matcher = SubjectMatcher::new();
        let mut by_subject = HashMap::with_capacity(bindings.len());
        let bindings: Vec<Arc<ConsumerBinding>> = bindings.into_iter().map(Arc::new).collect();
        for binding in &bindings {
            matcher.insert(binding.subject());
            by_subject.insert(binding.subject().to_string(), Arc::clone(binding));
        }

        let jetstream = jetstream::new(client.clone());
        let queue = WorkQueue::new(options.queue_capacity);
        let metrics = ConsumerMetrics::new(&consumer_id);

        Ok(Self {
            inner: Arc::new(Inner {
                consumer_id,
                durable,
                options,
                bindings,
                by_subject,
                matcher,
                queue,
                client,
                jetstream,
                metrics,
            }),
        })
    }

    /// The consumer identity this processor owns.
    pub fn consumer_id(&self) -> &str {
        &self.inner.consumer_id
    }

    /// Whether this processor attaches to a durable JetStream consumer.
    pub fn durable(&self) -> bool {
        self.inner.durable
    }

    /// Run the listener and dispatcher until cancellation or a fatal
    /// fault.
    ///
    /// A fault in either task cancels its peer, both are joined, and the
    /// fault is surfaced. Cancellation drains running handlers before
    /// returning.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        let inner = Arc::clone(&self.inner);
        info!(
            consumer = %inner.consumer_id,
            durable = inner.durable,
            bindings = inner.bindings.len(),
            max_dop = inner.options.max_dop,
            queue_capacity = inner.queue.capacity(),
            "Starting subscription processor"
        );

        let linked = cancel.child_token();
        let mut listener = tokio::spawn(run_listener(Arc::clone(&inner), linked.clone()));
        let mut dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&inner), linked.clone()));

        let first;
        let listener_finished_first;
        tokio::select! {
            result = &mut listener => {
                first = flatten(result);
                listener_finished_first = true;
            }
            result = &mut dispatcher => {
                first = flatten(result);
                listener_finished_first = false;
            }
        }

        linked.cancel();
        let second = if listener_finished_first {
            flatten((&mut dispatcher).await)
        } else {
            flatten((&mut listener).await)
        };

        match first {
            Err(fault) => {
                error!(consumer = %inner.consumer_id, error = %fault, "Subscription processor faulted");
                Err(fault)
            }
            Ok(()) => second,
        }
    }
}

fn flatten(result: Result<Result<(), ConsumerError>, JoinError>) -> Result<(), ConsumerError> {
    match result {
        Ok(inner) => inner,
        Err(join) => Err(ConsumerError::TaskFailed(join.to_string())),
    }
}

async fn run_listener(inner: Arc<Inner>, cancel: CancellationToken) -> Result<(), ConsumerError> {
    if inner.durable {
        run_jetstream_listener(inner, cancel).await
    } else {
        run_core_listener(inner, cancel).await
    }
}

/// JetStream mode: resolve the stream for every bound subject, attach to
/// the pre-existing durable consumer on each, and merge the deliveries.
async fn run_jetstream_listener(
    inner: Arc<Inner>,
    cancel: CancellationToken,
) -> Result<(), ConsumerError> {
    let streams = list_streams(&inner.jetstream).await?;

    let mut stream_names: Vec<String> = Vec::new();
    for binding in &inner.bindings {
        let name = resolve_stream(&streams, binding.subject())?;
        debug!(
            consumer = %inner.consumer_id,
            subject = binding.subject(),
            stream = %name,
            "Resolved stream for binding"
        );
        if !stream_names.contains(&name) {
            stream_names.push(name);
        }
    }

    let mut sources = Vec::with_capacity(stream_names.len());
    for name in &stream_names {
        let stream = inner
            .jetstream
            .get_stream(name)
            .await
            .map_err(ConsumerError::jetstream)?;

        let consumer: PullConsumer = stream.get_consumer(&inner.consumer_id).await.map_err(
            |error| ConsumerError::ConsumerNotFound {
                consumer: inner.consumer_id.clone(),
                stream: name.clone(),
                reason: error.to_string(),
            },
        )?;

        let messages = consumer
            .messages()
            .await
            .map_err(ConsumerError::jetstream)?;
        sources.push(messages.boxed());
    }

    info!(
        consumer = %inner.consumer_id,
        streams = ?stream_names,
        "Attached to durable consumer"
    );

    let mut merged = stream::select_all(sources);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = merged.next() => match next {
                Some(Ok(message)) => enqueue_jetstream(&inner, &cancel, message).await?,
                Some(Err(error)) => return Err(ConsumerError::jetstream(error)),
                None => return Err(ConsumerError::SubscriptionClosed),
            },
        }
    }
}

async fn enqueue_jetstream(
    inner: &Arc<Inner>,
    cancel: &CancellationToken,
    message: jetstream::Message,
) -> Result<(), ConsumerError> {
    inner.metrics.message_received();

    let subject = message.subject.to_string();
    let Some(pattern) = inner.matcher.resolve(&subject) else {
        warn!(
            consumer = %inner.consumer_id,
            %subject,
            "No binding matches subject, skipping message"
        );
        inner.metrics.subject_match_miss();
        return Ok(());
    };
    let Some(binding) = inner.by_subject.get(pattern).cloned() else {
        warn!(consumer = %inner.consumer_id, pattern, "Matched pattern has no binding");
        return Ok(());
    };

    let delivery_count = message
        .info()
        .map(|info| info.delivered as u64)
        .unwrap_or(1);

    let raw = RawMessage {
        subject,
        payload: message.payload.clone(),
        reply: None,
        delivery_count,
    };
    let item = WorkItem {
        binding,
        raw,
        ack: AckChannel::JetStream(message),
    };

    match inner.queue.enqueue(item, cancel).await {
        Ok(()) | Err(QueueError::Cancelled) => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// Core mode: one binding, one subscription, optionally inside a queue
/// group whose placeholders are resolved here.
async fn run_core_listener(
    inner: Arc<Inner>,
    cancel: CancellationToken,
) -> Result<(), ConsumerError> {
    let binding = Arc::clone(&inner.bindings[0]);
    let subject = binding.subject().to_string();
    let group = binding
        .queue_group()
        .map(resolve_queue_group)
        .unwrap_or_default();

    let mut subscription = if group.is_empty() {
        inner.client.subscribe(subject.clone()).await?
    } else {
        info!(
            consumer = %inner.consumer_id,
            %subject,
            queue_group = %group,
            "Joining queue group"
        );
        inner
            .client
            .queue_subscribe(subject.clone(), group.clone())
            .await?
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = subscription.unsubscribe().await;
                return Ok(());
            }
            next = subscription.next() => match next {
                Some(message) => {
                    inner.metrics.message_received();
                    let raw = RawMessage {
                        subject: message.subject.to_string(),
                        payload: message.payload,
                        reply: message.reply.map(|reply| reply.to_string()),
                        delivery_count: 1,
                    };
                    let item = WorkItem {
                        binding: Arc::clone(&binding),
                        raw,
                        ack: AckChannel::Core,
                    };
                    match inner.queue.enqueue(item, &cancel).await {
                        Ok(()) | Err(QueueError::Cancelled) => {}
                        Err(error) => return Err(error.into()),
                    }
                }
                None => return Err(ConsumerError::SubscriptionClosed),
            },
        }
    }
}

/// Drain the queue in batches, running handlers concurrently under the
/// degree-of-parallelism semaphore.
async fn run_dispatcher(inner: Arc<Inner>, cancel: CancellationToken) -> Result<(), ConsumerError> {
    let semaphore = Arc::new(Semaphore::new(inner.options.max_dop));
    let mut running = JoinSet::new();
    let batch_size = if inner.options.batching {
        inner.options.max_dop
    } else {
        1
    };

    'dispatch: loop {
        while running.try_join_next().is_some() {}

        let batch = match inner
            .queue
            .read_batch(batch_size, inner.options.batch_idle_timeout, &cancel)
            .await
        {
            Ok(batch) => batch,
            Err(QueueError::Cancelled) => break 'dispatch,
            Err(error) => {
                error!(
                    consumer = %inner.consumer_id,
                    %error,
                    "Dispatcher failed to read work, backing off"
                );
                tokio::time::sleep(TRANSIENT_BACKOFF).await;
                continue;
            }
        };

        for item in batch {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'dispatch,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'dispatch,
                },
            };

            let task_inner = Arc::clone(&inner);
            let invocation_cancel = cancel.child_token();
            running.spawn(async move {
                execute_work_item(task_inner, item, invocation_cancel).await;
                drop(permit);
            });
        }
    }

    debug!(consumer = %inner.consumer_id, "Dispatcher draining running handlers");
    while running.join_next().await.is_some() {}
    Ok(())
}

/// Run one handler invocation and translate its outcome to the wire.
async fn execute_work_item(inner: Arc<Inner>, item: WorkItem, cancel: CancellationToken) {
    let WorkItem { binding, raw, ack } = item;
    let handler = binding.handler_name();
    let reply_to = raw.reply.clone();
    let payload = raw.payload.clone();
    let started = Instant::now();

    let outcome = binding.invoke(raw, cancel).await;
    let elapsed = started.elapsed();

    match ack {
        AckChannel::JetStream(message) => match outcome {
            Ok(result) => match ack_decision(&result) {
                AckDecision::Ack => {
                    if let Err(error) = message.ack().await {
                        warn!(consumer = %inner.consumer_id, handler, %error, "Ack failed");
                    }
                    inner
                        .metrics
                        .handler_completed(handler, HandlerStatus::Ack, elapsed);
                }
                AckDecision::Nak(delay) => {
                    if let Err(error) = message.ack_with(AckKind::Nak(delay)).await {
                        warn!(consumer = %inner.consumer_id, handler, %error, "Nak failed");
                    }
                    inner
                        .metrics
                        .handler_completed(handler, HandlerStatus::Retry, elapsed);
                }
                AckDecision::Term => {
                    if let Err(error) = message.ack_with(AckKind::Term).await {
                        warn!(consumer = %inner.consumer_id, handler, %error, "Term failed");
                    }
                    inner
                        .metrics
                        .handler_completed(handler, HandlerStatus::Terminate, elapsed);
                }
            },
            Err(InvokeError::Decode(error)) => {
                // No ack: the broker redelivers until its own policy
                // terminates the message.
                warn!(
                    consumer = %inner.consumer_id,
                    handler,
                    %error,
                    payload = %payload_preview(&payload),
                    "Payload decode failed, skipping message"
                );
                inner.metrics.decode_failed(handler);
            }
            Err(InvokeError::Handler(error)) => {
                warn!(
                    consumer = %inner.consumer_id,
                    handler,
                    %error,
                    "Handler failed, leaving message for redelivery"
                );
                inner
                    .metrics
                    .handler_failed(handler, error.category(), elapsed);
            }
        },
        AckChannel::Core => match outcome {
            Ok(result) => {
                if let (Some(reply), Some(reply_payload)) = (reply_to, result.reply.clone()) {
                    if let Err(error) = inner.client.publish(reply, reply_payload).await {
                        warn!(consumer = %inner.consumer_id, handler, %error, "Reply publish failed");
                    }
                }
                let status = match ack_decision(&result) {
                    AckDecision::Ack => HandlerStatus::Ack,
                    AckDecision::Nak(_) => HandlerStatus::Retry,
                    AckDecision::Term => HandlerStatus::Terminate,
                };
                inner.metrics.handler_completed(handler, status, elapsed);
            }
            Err(InvokeError::Decode(error)) => {
                warn!(
                    consumer = %inner.consumer_id,
                    handler,
                    %error,
                    payload = %payload_preview(&payload),
                    "Payload decode failed, dropping message"
                );
                inner.metrics.decode_failed(handler);
            }
            Err(InvokeError::Handler(error)) => {
                warn!(
                    consumer = %inner.consumer_id,
                    handler,
                    %error,
                    "Handler failed, dropping message"
                );
                inner
                    .metrics
                    .handler_failed(handler, error.category(), elapsed);
            }
        },
    }
}

/// List every stream with its configured subjects.
async fn list_streams(
    context: &jetstream::Context,
) -> Result<Vec<(String, Vec<String>)>, ConsumerError> {
    let streams = context.streams();
    let mut streams = std::pin::pin!(streams);

    let mut collected = Vec::new();
    while let Some(info) = streams.next().await {
        let info = info.map_err(ConsumerError::jetstream)?;
        let subjects = info
            .config
            .subjects
            .iter()
            .map(|subject| subject.to_string())
            .collect();
        collected.push((info.config.name.clone(), subjects));
    }
    Ok(collected)
}

/// Find the single stream capturing a bound subject; zero or several is a
/// deployment error.
fn resolve_stream(
    streams: &[(String, Vec<String>)],
    subject: &str,
) -> Result<String, ConsumerError> {
    let matches: Vec<&String> = streams
        .iter()
        .filter(|(_, subjects)| {
            subjects
                .iter()
                .any(|stream_subject| pattern_covers(stream_subject, subject))
        })
        .map(|(name, _)| name)
        .collect();

    match matches.as_slice() {
        [] => Err(ConsumerError::StreamNotFound {
            subject: subject.to_string(),
        }),
        [single] => Ok((*single).to_string()),
        several => Err(ConsumerError::AmbiguousStream {
            subject: subject.to_string(),
            matches: several.iter().map(|name| name.to_string()).collect(),
        }),
    }
}

/// Whether a stream's subject pattern captures every subject the bound
/// pattern can produce.
fn pattern_covers(stream_pattern: &str, bound: &str) -> bool {
    let stream_tokens: Vec<&str> = stream_pattern.split('.').collect();
    let bound_tokens: Vec<&str> = bound.split('.').collect();

    for (index, stream_token) in stream_tokens.iter().enumerate() {
        if *stream_token == ">" {
            return true;
        }
        let Some(bound_token) = bound_tokens.get(index) else {
            return false;
        };
        if *bound_token == ">" {
            // The bound tail reaches deeper than this pattern can.
            return false;
        }
        if *stream_token == "*" {
            continue;
        }
        if *bound_token == "*" || stream_token != bound_token {
            return false;
        }
    }

    stream_tokens.len() == bound_tokens.len()
}

fn payload_preview(payload: &[u8]) -> String {
    let slice = &payload[..payload.len().min(PAYLOAD_PREVIEW_LIMIT)];
    match std::str::from_utf8(slice) {
        Ok(text) => text.to_string(),
        Err(_) => format!("{slice:02x?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_decision_table() {
        assert_eq!(ack_decision(&HandlerResult::ack()), AckDecision::Ack);
        assert_eq!(
            ack_decision(&HandlerResult::retry()),
            AckDecision::Nak(None)
        );
        assert_eq!(
            ack_decision(&HandlerResult::retry_after(Duration::from_secs(3))),
            AckDecision::Nak(Some(Duration::from_secs(3)))
        );
        assert_eq!(ack_decision(&HandlerResult::terminate()), AckDecision::Term);

        // An acknowledged result ignores the retry flag.
        let mut conflicted = HandlerResult::ack();
        conflicted.should_retry = true;
        assert_eq!(ack_decision(&conflicted), AckDecision::Ack);
    }

    #[test]
    fn test_pattern_covers() {
        assert!(pattern_covers("evt.>", "evt.orders.created"));
        assert!(pattern_covers("evt.>", "evt.orders.>"));
        assert!(pattern_covers("evt.*", "evt.orders"));
        assert!(pattern_covers("evt.*.created", "evt.orders.created"));
        assert!(pattern_covers(">", "anything.at.all"));
        assert!(pattern_covers("evt.orders", "evt.orders"));

        assert!(!pattern_covers("evt.orders", "evt.payments"));
        assert!(!pattern_covers("evt.*", "evt.orders.created"));
        assert!(!pattern_covers("evt.*", "evt.>"));
        assert!(!pattern_covers("evt.orders", "evt.*"));
        assert!(!pattern_covers("evt.orders.created", "evt.orders"));
    }

    #[test]
    fn test_resolve_stream_single_match() {
        let streams = vec![
            ("ORDERS".to_string(), vec!["orders.>".to_string()]),
            ("PAYMENTS".to_string(), vec!["payments.>".to_string()]),
        ];
        assert_eq!(
            resolve_stream(&streams, "orders.created").unwrap(),
            "ORDERS"
        );
    }

    #[test]
    fn test_resolve_stream_none_is_fatal() {
        let streams = vec![("ORDERS".to_string(), vec!["orders.>".to_string()])];
        let err = resolve_stream(&streams, "shipments.created").unwrap_err();
        assert!(matches!(err, ConsumerError::StreamNotFound { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_resolve_stream_ambiguity_is_fatal() {
        let streams = vec![
            ("ALL".to_string(), vec![">".to_string()]),
            ("ORDERS".to_string(), vec!["orders.>".to_string()]),
        ];
        let err = resolve_stream(&streams, "orders.created").unwrap_err();
        match &err {
            ConsumerError::AmbiguousStream { matches, .. } => {
                assert_eq!(matches.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_fatal());
    }

    #[test]
    fn test_payload_preview_truncates_and_handles_binary() {
        let long = "x".repeat(500);
        assert_eq!(payload_preview(long.as_bytes()).len(), PAYLOAD_PREVIEW_LIMIT);

        let binary = [0xff, 0x00, 0xab];
        let preview = payload_preview(&binary);
        assert!(preview.contains("ff"));
    }
}
