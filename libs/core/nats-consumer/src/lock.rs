//! Distributed locks over a revisioned key-value bucket.
//!
//! A lock is a KV entry holding a lease document (owner + expiry). Every
//! transition is guarded by the bucket's revision numbers, which is what
//! makes the lock safe: create-if-absent to acquire, compare-and-swap to
//! steal an expired lease or renew a live one, revision-guarded delete to
//! release. A crashed holder's lease simply expires and the next caller
//! steals it.
//!
//! The lock is advisory. Pick `renew_interval` well under `lease`
//! (about half) so a slow renewal does not lose a healthy lock.

use async_nats::jetstream::kv::{CreateErrorKind, Store};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default bucket backing the locks.
pub const LOCK_BUCKET: &str = "locks";

/// Best-effort deadline for the release issued on handle disposal.
const DISPOSE_RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Error from a lock operation.
#[derive(Debug, Error)]
pub enum LockError {
    /// Key-value transport or bucket error.
    #[error("lock key-value error: {0}")]
    Kv(String),

    /// Lock document failed to serialize or deserialize.
    #[error("lock document error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The lock is no longer held: the revision moved, the owner changed,
    /// or the entry is gone.
    #[error("lock on '{key}' lost: {reason}")]
    Lost { key: String, reason: &'static str },

    /// The caller's cancellation token fired during an acquire.
    #[error("lock acquisition cancelled")]
    Cancelled,
}

impl LockError {
    fn kv(error: impl std::fmt::Display) -> Self {
        Self::Kv(error.to_string())
    }

    fn lost(key: &str, reason: &'static str) -> Self {
        Self::Lost {
            key: key.to_string(),
            reason,
        }
    }
}

/// The stored lease document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDocument {
    /// Opaque holder identity.
    pub owner: String,

    /// Wall-clock lease expiry, unix milliseconds.
    pub expires_at_unix_ms: i64,
}

impl LockDocument {
    /// Create a document with a lease starting now.
    pub fn new(owner: impl Into<String>, lease: Duration) -> Self {
        Self {
            owner: owner.into(),
            expires_at_unix_ms: now_unix_ms() + lease.as_millis() as i64,
        }
    }

    /// Whether the lease has expired at the given instant.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_unix_ms
    }

    fn encode(&self) -> Result<bytes::Bytes, LockError> {
        Ok(serde_json::to_vec(self)?.into())
    }
}

/// Observed state of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// No live lease exists.
    Free,
    /// The probing owner holds a live lease.
    HeldBySelf,
    /// Another owner holds a live lease.
    HeldByOther(String),
}

/// Configuration for the lock manager.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease duration written on acquire and renew.
    pub lease: Duration,

    /// Interval between background renewals. Defaults to half the lease.
    pub renew_interval: Duration,

    /// Lower bound of the jittered back-off while a lock is contended.
    pub acquire_base_delay: Duration,

    /// Upper bound of the jittered back-off while a lock is contended.
    pub acquire_max_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        let lease = Duration::from_secs(20);
        Self {
            lease,
            renew_interval: lease / 2,
            acquire_base_delay: Duration::from_millis(50),
            acquire_max_delay: Duration::from_millis(250),
        }
    }
}

impl LockConfig {
    /// Set the lease duration; the renew interval follows at half of it.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self.renew_interval = lease / 2;
        self
    }

    /// Override the renew interval.
    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    /// Set the contention back-off bounds.
    pub fn with_acquire_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.acquire_base_delay = base;
        self.acquire_max_delay = max.max(base);
        self
    }
}

/// Lock manager over one KV bucket.
#[derive(Clone)]
pub struct DistributedLocks {
    store: Store,
    config: LockConfig,
}

impl DistributedLocks {
    /// Create a manager over an attached bucket.
    pub fn new(store: Store, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Try to acquire the lock, waiting up to `timeout` while it is held
    /// by a live lease. Returns `None` when the timeout elapses first.
    pub async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<LockHandle>, LockError> {
        let deadline = Instant::now() + timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }

            match self.attempt_acquire(key, owner).await? {
                Attempt::Acquired(revision) => {
                    info!(key, owner, revision, "Lock acquired");
                    return Ok(Some(self.spawn_handle(key, owner, revision)));
                }
                Attempt::Raced => {
                    // Someone else moved the entry between read and write;
                    // retry immediately.
                    continue;
                }
                Attempt::Held => {
                    if Instant::now() >= deadline {
                        debug!(key, owner, "Lock acquisition timed out");
                        return Ok(None);
                    }
                    let delay = self.contention_delay(deadline);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LockError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Renew a held lock. Succeeds only when the revision still matches and
    /// the owner is unchanged; the new revision is returned.
    pub async fn renew(
        &self,
        key: &str,
        expected_revision: u64,
        owner: &str,
    ) -> Result<u64, LockError> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(LockError::kv)?
            .ok_or_else(|| LockError::lost(key, "entry is gone"))?;

        if entry.revision != expected_revision {
            return Err(LockError::lost(key, "revision moved"));
        }
        if entry.value.is_empty() {
            return Err(LockError::lost(key, "entry is gone"));
        }

        let document: LockDocument = serde_json::from_slice(&entry.value)?;
        if document.owner != owner {
            return Err(LockError::lost(key, "owner changed"));
        }

        let renewed = LockDocument::new(owner, self.config.lease);
        self.store
            .update(key, renewed.encode()?, expected_revision)
            .await
            .map_err(|_| LockError::lost(key, "compare-and-swap failed"))
    }

    /// Release a held lock. Best-effort: a lock that is already gone, has
    /// moved on, or belongs to someone else counts as released.
    pub async fn release(
        &self,
        key: &str,
        expected_revision: u64,
        owner: &str,
    ) -> Result<(), LockError> {
        let entry = match self.store.entry(key).await.map_err(LockError::kv)? {
            Some(entry) => entry,
            None => return Ok(()),
        };

        if entry.revision != expected_revision || entry.value.is_empty() {
            return Ok(());
        }
        let owned = serde_json::from_slice::<LockDocument>(&entry.value)
            .map(|document| document.owner == owner)
            .unwrap_or(false);
        if !owned {
            return Ok(());
        }

        // A mismatch here means the lock moved after our read; either way
        // it is no longer ours to delete.
        if let Err(error) = self
            .store
            .delete_expect_revision(key, Some(expected_revision))
            .await
        {
            debug!(key, owner, %error, "Revision-guarded delete failed, treating lock as released");
        }
        Ok(())
    }

    /// Probe the current state of a lock from `owner`'s perspective.
    pub async fn check(&self, key: &str, owner: &str) -> Result<LockStatus, LockError> {
        let entry = match self.store.entry(key).await.map_err(LockError::kv)? {
            Some(entry) if !entry.value.is_empty() => entry,
            _ => return Ok(LockStatus::Free),
        };

        let document: LockDocument = match serde_json::from_slice(&entry.value) {
            Ok(document) => document,
            Err(error) => {
                warn!(key, %error, "Unreadable lock document");
                return Ok(LockStatus::Free);
            }
        };

        if document.is_expired_at(now_unix_ms()) {
            Ok(LockStatus::Free)
        } else if document.owner == owner {
            Ok(LockStatus::HeldBySelf)
        } else {
            Ok(LockStatus::HeldByOther(document.owner))
        }
    }

    async fn attempt_acquire(&self, key: &str, owner: &str) -> Result<Attempt, LockError> {
        let entry = self.store.entry(key).await.map_err(LockError::kv)?;
        let document = LockDocument::new(owner, self.config.lease);

        match entry {
            None => match self.store.create(key, document.encode()?).await {
                Ok(revision) => Ok(Attempt::Acquired(revision)),
                Err(error) if error.kind() == CreateErrorKind::AlreadyExists => {
                    Ok(Attempt::Raced)
                }
                Err(error) => Err(LockError::kv(error)),
            },
            Some(entry) => {
                // A delete tombstone, an unreadable document, or an expired
                // lease can all be taken over; only a live, readable lease
                // blocks us. Stealing is CAS-guarded by the read revision.
                let stealable = entry.value.is_empty()
                    || serde_json::from_slice::<LockDocument>(&entry.value)
                        .map(|current| current.is_expired_at(now_unix_ms()))
                        .unwrap_or(true);

                if !stealable {
                    return Ok(Attempt::Held);
                }

                match self
                    .store
                    .update(key, document.encode()?, entry.revision)
                    .await
                {
                    Ok(revision) => Ok(Attempt::Acquired(revision)),
                    Err(error) => {
                        debug!(key, owner, %error, "Lost steal race");
                        Ok(Attempt::Raced)
                    }
                }
            }
        }
    }

    fn contention_delay(&self, deadline: Instant) -> Duration {
        let base = self.config.acquire_base_delay;
        let max = self.config.acquire_max_delay.max(base);
        let jittered = rand::thread_rng().gen_range(base..=max);
        jittered.min(deadline.saturating_duration_since(Instant::now()))
    }

    fn spawn_handle(&self, key: &str, owner: &str, revision: u64) -> LockHandle {
        let revision = Arc::new(AtomicU64::new(revision));
        let cancel = CancellationToken::new();

        let renew_task = {
            let locks = self.clone();
            let key = key.to_string();
            let owner = owner.to_string();
            let revision = Arc::clone(&revision);
            let cancel = cancel.clone();
            let interval = self.config.renew_interval;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            match locks.renew(&key, revision.load(Ordering::SeqCst), &owner).await {
                                Ok(next) => {
                                    revision.store(next, Ordering::SeqCst);
                                    debug!(key, owner, revision = next, "Lock renewed");
                                }
                                Err(error) => {
                                    // The lock is gone; nothing left to renew.
                                    debug!(key, owner, %error, "Lock renewal failed, stopping");
                                    break;
                                }
                            }
                        }
                    }
                }
            })
        };

        LockHandle {
            key: key.to_string(),
            owner: owner.to_string(),
            revision,
            cancel,
            released: AtomicBool::new(false),
            locks: self.clone(),
            _renew_task: renew_task,
        }
    }
}

enum Attempt {
    Acquired(u64),
    Raced,
    Held,
}

/// A held lock.
///
/// The handle renews its lease in the background. Dropping it cancels the
/// renewal and issues a best-effort release; [`LockHandle::release`] does
/// the same but lets the caller await the outcome.
pub struct LockHandle {
    key: String,
    owner: String,
    revision: Arc<AtomicU64>,
    cancel: CancellationToken,
    released: AtomicBool,
    locks: DistributedLocks,
    _renew_task: tokio::task::JoinHandle<()>,
}

impl LockHandle {
    /// The locked key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The holder identity.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The last revision observed for the lease entry.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Release the lock and wait for the outcome.
    pub async fn release(self) -> Result<(), LockError> {
        self.cancel.cancel();
        self.released.store(true, Ordering::SeqCst);
        self.locks
            .release(&self.key, self.revision.load(Ordering::SeqCst), &self.owner)
            .await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.released.load(Ordering::SeqCst) {
            return;
        }

        let locks = self.locks.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        let revision = self.revision.load(Ordering::SeqCst);

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let release = locks.release(&key, revision, &owner);
                if tokio::time::timeout(DISPOSE_RELEASE_TIMEOUT, release)
                    .await
                    .is_err()
                {
                    warn!(key, owner, "Best-effort lock release timed out");
                }
            });
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("revision", &self.revision())
            .finish()
    }
}

fn now_unix_ms() -> i64 {
    Utc::now().timestamp_millis()
}
