//! NATS client facade.
//!
//! A thin wrapper over the NATS connection that bundles the pieces of this
//! crate: publish/subscribe/request-reply pass-throughs, JetStream and KV
//! handles, consumer mapping, and distributed locks.

use crate::error::ConsumerError;
use crate::lock::{DistributedLocks, LockConfig, LockHandle, LockStatus, LOCK_BUCKET};
use crate::registry::ConsumerRegistry;
use async_nats::jetstream::{self, kv};
use async_nats::{ConnectOptions, Subscriber};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Configuration for the NATS connection.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URLs.
    pub servers: Vec<String>,

    /// Client connection name.
    pub name: String,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Request-reply timeout.
    pub request_timeout: Duration,

    /// Lock manager configuration.
    pub lock: LockConfig,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            name: "nats-consumer".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            lock: LockConfig::default(),
        }
    }
}

impl NatsConfig {
    /// Configuration for a single server URL.
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            servers: vec![server.into()],
            ..Default::default()
        }
    }

    /// Set the client connection name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the lock manager configuration.
    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }
}

/// NATS client wrapper exposing the consumption pipeline entry points.
#[derive(Clone)]
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
    locks: std::sync::Arc<OnceCell<DistributedLocks>>,
}

impl NatsClient {
    /// Connect to NATS with the given configuration.
    pub async fn connect(config: NatsConfig) -> Result<Self, ConsumerError> {
        let options = ConnectOptions::new()
            .name(&config.name)
            .connection_timeout(config.connect_timeout)
            .request_timeout(Some(config.request_timeout));

        let client = options.connect(config.servers.join(",")).await?;
        let jetstream = jetstream::new(client.clone());

        info!(servers = ?config.servers, name = %config.name, "Connected to NATS");

        Ok(Self {
            client,
            jetstream,
            config,
            locks: std::sync::Arc::new(OnceCell::new()),
        })
    }

    /// Wrap an existing connection.
    pub fn from_client(client: async_nats::Client, config: NatsConfig) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            config,
            locks: std::sync::Arc::new(OnceCell::new()),
        }
    }

    /// Publish a JSON-serialized message.
    pub async fn publish<T: Serialize>(
        &self,
        subject: impl Into<String>,
        message: &T,
    ) -> Result<(), ConsumerError> {
        let payload = serde_json::to_vec(message)?;
        self.publish_raw(subject, payload.into()).await
    }

    /// Publish raw payload bytes.
    pub async fn publish_raw(
        &self,
        subject: impl Into<String>,
        payload: Bytes,
    ) -> Result<(), ConsumerError> {
        self.client
            .publish(subject.into(), payload)
            .await
            .map_err(ConsumerError::publish)
    }

    /// Subscribe to a subject.
    pub async fn subscribe(&self, subject: impl Into<String>) -> Result<Subscriber, ConsumerError> {
        Ok(self.client.subscribe(subject.into()).await?)
    }

    /// Subscribe to a subject within a queue group.
    pub async fn queue_subscribe(
        &self,
        subject: impl Into<String>,
        queue_group: impl Into<String>,
    ) -> Result<Subscriber, ConsumerError> {
        Ok(self
            .client
            .queue_subscribe(subject.into(), queue_group.into())
            .await?)
    }

    /// JSON request-reply.
    pub async fn request<T: Serialize, R: DeserializeOwned>(
        &self,
        subject: impl Into<String>,
        request: &T,
    ) -> Result<R, ConsumerError> {
        let payload = serde_json::to_vec(request)?;
        let response = self
            .client
            .request(subject.into(), payload.into())
            .await
            .map_err(ConsumerError::request)?;
        Ok(serde_json::from_slice(&response.payload)?)
    }

    /// Flush the connection (round-trips to the server).
    pub async fn ping(&self) -> Result<(), ConsumerError> {
        self.client
            .flush()
            .await
            .map_err(ConsumerError::jetstream)
    }

    /// Drain the connection and close it.
    pub async fn shutdown(self) -> Result<(), ConsumerError> {
        self.client
            .drain()
            .await
            .map_err(ConsumerError::jetstream)
    }

    /// The JetStream context.
    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    /// Attach to a KV bucket.
    pub async fn key_value(&self, bucket: &str) -> Result<kv::Store, ConsumerError> {
        self.jetstream
            .get_key_value(bucket)
            .await
            .map_err(ConsumerError::key_value)
    }

    /// Current connection state. Reconnection itself is handled by the
    /// underlying client.
    pub fn connection_state(&self) -> async_nats::connection::State {
        self.client.connection_state()
    }

    /// The underlying NATS client, for operations not wrapped here.
    pub fn inner(&self) -> &async_nats::Client {
        &self.client
    }

    /// Run every consumer registered in `registry` until cancellation.
    ///
    /// Any fault here means a listener or dispatcher task died — whether
    /// from a configuration mistake or a transport failure, the pipeline is
    /// no longer consuming; per the fail-fast contract the process is
    /// aborted rather than left half-running.
    pub async fn map_consumers(
        &self,
        registry: ConsumerRegistry,
        cancel: CancellationToken,
    ) -> Result<(), ConsumerError> {
        match registry.run(self.client.clone(), cancel).await {
            Ok(()) => Ok(()),
            Err(fault) => {
                error!(error = %fault, "Consumer processor faulted, aborting");
                std::process::abort();
            }
        }
    }

    /// Attach the `locks` bucket and prime the lock manager.
    ///
    /// The bucket is provisioned out of band; attaching to a missing one
    /// is an error. Called lazily by
    /// [`NatsClient::acquire_distributed_lock`] when skipped at startup.
    pub async fn setup_kv_stores(&self) -> Result<(), ConsumerError> {
        self.lock_manager().await.map(|_| ())
    }

    /// Acquire a distributed lock, waiting up to `timeout` while it is
    /// held elsewhere. Returns `None` when the timeout elapses first.
    pub async fn acquire_distributed_lock(
        &self,
        key: &str,
        owner: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<LockHandle>, ConsumerError> {
        let locks = self.lock_manager().await?;
        Ok(locks.try_acquire(key, owner, timeout, cancel).await?)
    }

    /// Probe a distributed lock from `owner`'s perspective.
    pub async fn check_distributed_lock(
        &self,
        key: &str,
        owner: &str,
    ) -> Result<LockStatus, ConsumerError> {
        let locks = self.lock_manager().await?;
        Ok(locks.check(key, owner).await?)
    }

    async fn lock_manager(&self) -> Result<&DistributedLocks, ConsumerError> {
        self.locks
            .get_or_try_init(|| async {
                let store = self
                    .jetstream
                    .get_key_value(LOCK_BUCKET)
                    .await
                    .map_err(ConsumerError::key_value)?;
                info!(bucket = LOCK_BUCKET, "Lock bucket attached");
                Ok(DistributedLocks::new(store, self.config.lock.clone()))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = NatsConfig::default();
        assert_eq!(config.servers, vec!["nats://localhost:4222"]);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_builder() {
        let config = NatsConfig::new("nats://broker:4222")
            .with_name("orders-service")
            .with_lock_config(LockConfig::default().with_lease(Duration::from_secs(60)));
        assert_eq!(config.servers, vec!["nats://broker:4222"]);
        assert_eq!(config.name, "orders-service");
        assert_eq!(config.lock.lease, Duration::from_secs(60));
    }
}
