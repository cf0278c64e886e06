//! Consumer registry: collects handler registrations, groups them by
//! consumer identity, and runs one subscription processor per group.
//!
//! Registration is explicit and typed; each call erases one handler behind
//! a binding adapter. The registry is consumed at bootstrap by
//! [`ConsumerRegistry::run`], which starts every processor and treats a
//! faulted processor as a deployment error the process must not survive.

use crate::binding::ConsumerBinding;
use crate::error::ConsumerError;
use crate::processor::SubscriptionProcessor;
use messaging::{ConsumerOptions, MessageHandler};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What to do when the same subject pattern is registered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateSubjectPolicy {
    /// Reject the registration (deployment error).
    #[default]
    FailFast,
    /// Keep the first registration and skip the duplicate.
    Skip,
}

/// Collects consumer registrations at bootstrap.
///
/// # Example
///
/// ```rust,ignore
/// let mut registry = ConsumerRegistry::new();
/// registry.register(
///     "orders.>",
///     ConsumerOptions::from_env().with_consumer_id("orders-consumer"),
///     OrderHandler::new(store),
/// )?;
/// client.map_consumers(registry, shutdown.clone()).await?;
/// ```
#[derive(Debug)]
pub struct ConsumerRegistry {
    bindings: Vec<(ConsumerBinding, ConsumerOptions)>,
    duplicate_policy: DuplicateSubjectPolicy,
}

impl Default for ConsumerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerRegistry {
    /// Create an empty registry with the fail-fast duplicate policy.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            duplicate_policy: DuplicateSubjectPolicy::default(),
        }
    }

    /// Set the duplicate-subject policy.
    pub fn with_duplicate_policy(mut self, policy: DuplicateSubjectPolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// Register a handler for a subject pattern.
    ///
    /// The handler's payload type and signature are fixed by the
    /// [`MessageHandler`] implementation, so a malformed handler is a
    /// compile error rather than a startup one. An empty subject or a
    /// duplicate under the fail-fast policy is rejected here.
    pub fn register<H: MessageHandler>(
        &mut self,
        subject: impl Into<String>,
        options: ConsumerOptions,
        handler: H,
    ) -> Result<&mut Self, ConsumerError> {
        let subject = subject.into();
        if subject.is_empty() {
            return Err(ConsumerError::config("subject pattern must not be empty"));
        }

        if self
            .bindings
            .iter()
            .any(|(binding, _)| binding.subject() == subject)
        {
            match self.duplicate_policy {
                DuplicateSubjectPolicy::FailFast => {
                    return Err(ConsumerError::DuplicateBinding(subject));
                }
                DuplicateSubjectPolicy::Skip => {
                    warn!(%subject, "Duplicate subject registration skipped");
                    return Ok(self);
                }
            }
        }

        let binding = ConsumerBinding::new(
            subject,
            options.consumer_id.clone(),
            options.queue_group.clone(),
            handler,
        );
        info!(
            subject = binding.subject(),
            consumer = %binding.effective_consumer_id(),
            durable = binding.durable(),
            handler = binding.handler_name(),
            payload = binding.payload_type(),
            "Registered consumer binding"
        );
        self.bindings.push((binding, options));
        Ok(self)
    }

    /// Number of registered bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Group the registered bindings by effective consumer identity.
    ///
    /// Each group keeps its registration order and carries the options of
    /// its first binding.
    fn into_groups(self) -> Vec<ConsumerGroup> {
        let mut groups: Vec<ConsumerGroup> = Vec::new();
        for (binding, options) in self.bindings {
            let consumer_id = binding.effective_consumer_id();
            match groups.iter_mut().find(|group| group.consumer_id == consumer_id) {
                Some(group) => group.bindings.push(binding),
                None => groups.push(ConsumerGroup {
                    consumer_id,
                    options,
                    bindings: vec![binding],
                }),
            }
        }
        groups
    }

    /// Build one processor per consumer group.
    pub fn build_processors(
        self,
        client: async_nats::Client,
    ) -> Result<Vec<SubscriptionProcessor>, ConsumerError> {
        if self.is_empty() {
            return Err(ConsumerError::config(
                "no consumer bindings have been registered",
            ));
        }

        self.into_groups()
            .into_iter()
            .map(|group| {
                SubscriptionProcessor::new(
                    client.clone(),
                    group.consumer_id,
                    group.options,
                    group.bindings,
                )
            })
            .collect()
    }

    /// Start every processor and run until cancellation.
    ///
    /// A processor fault is a deployment-time configuration error
    /// surfacing at runtime: the remaining processors are cancelled and
    /// the fault is returned so the host can fail fast.
    pub async fn run(
        self,
        client: async_nats::Client,
        cancel: CancellationToken,
    ) -> Result<(), ConsumerError> {
        let processors = self.build_processors(client)?;
        info!(processors = processors.len(), "Starting consumer processors");

        let linked = cancel.child_token();
        let mut tasks = JoinSet::new();
        for processor in processors {
            let token = linked.clone();
            tasks.spawn(async move { processor.run(token).await });
        }

        let mut first_fault: Option<ConsumerError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join) => Err(ConsumerError::TaskFailed(join.to_string())),
            };
            if let Err(fault) = result {
                error!(error = %fault, "Consumer processor faulted, cancelling peers");
                linked.cancel();
                first_fault.get_or_insert(fault);
            }
        }

        match first_fault {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

struct ConsumerGroup {
    consumer_id: String,
    options: ConsumerOptions,
    bindings: Vec<ConsumerBinding>,
}
