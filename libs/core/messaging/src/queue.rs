//! Bounded work queue with a batching read.
//!
//! The queue is the back-pressure point between a subscription listener and
//! its dispatcher: producers wait when the queue is full, items are never
//! dropped, and delivery is FIFO on both sides.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Error from a queue operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// All senders or the receiver side is gone.
    #[error("work queue is closed")]
    Closed,

    /// The caller's cancellation token fired.
    #[error("work queue operation cancelled")]
    Cancelled,
}

/// A bounded multi-producer, multi-consumer FIFO of work items.
///
/// `enqueue` suspends while the queue is at capacity. `read_batch` blocks
/// for the first item, then keeps reading until either the batch is full or
/// no further item arrives within the idle timeout — trading a little
/// latency for throughput under load.
pub struct WorkQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    capacity: usize,
}

impl<T: Send> WorkQueue<T> {
    /// Create a queue with the given capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
        }
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue an item, waiting for space when the queue is full.
    pub async fn enqueue(&self, item: T, cancel: &CancellationToken) -> Result<(), QueueError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            sent = self.tx.send(item) => sent.map_err(|_| QueueError::Closed),
        }
    }

    /// Dequeue a single item, waiting until one is available.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<T, QueueError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            item = rx.recv() => item.ok_or(QueueError::Closed),
        }
    }

    /// Read up to `max` items.
    ///
    /// Blocks indefinitely for the first item. Subsequent items are awaited
    /// for at most `idle_timeout` each; when that elapses the batch is
    /// returned as-is. Cancellation is propagated at any point — an idle
    /// timeout is not a failure, a cancelled token is.
    pub async fn read_batch(
        &self,
        max: usize,
        idle_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, QueueError> {
        let max = max.max(1);
        let mut rx = self.rx.lock().await;

        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            item = rx.recv() => item.ok_or(QueueError::Closed)?,
        };

        let mut batch = Vec::with_capacity(max.min(64));
        batch.push(first);

        // Nothing can arrive "within" a zero timeout.
        if idle_timeout.is_zero() {
            return Ok(batch);
        }

        while batch.len() < max {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                next = tokio::time::timeout(idle_timeout, rx.recv()) => match next {
                    Ok(Some(item)) => batch.push(item),
                    // Channel closed mid-batch: hand back what we have.
                    Ok(None) => break,
                    // Idle timeout: the batch is complete as far as we care.
                    Err(_) => break,
                },
            }
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = WorkQueue::new(8);
        let ct = token();
        for i in 0..5 {
            queue.enqueue(i, &ct).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.dequeue(&ct).await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn test_enqueue_blocks_when_full() {
        let queue = Arc::new(WorkQueue::new(2));
        let ct = token();
        queue.enqueue(1, &ct).await.unwrap();
        queue.enqueue(2, &ct).await.unwrap();

        // Third enqueue must not complete until a slot frees up.
        let q = queue.clone();
        let blocked = tokio::spawn({
            let ct = ct.clone();
            async move { q.enqueue(3, &ct).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "enqueue should wait when full");

        assert_eq!(queue.dequeue(&ct).await.unwrap(), 1);
        blocked.await.unwrap().unwrap();
        assert_eq!(queue.dequeue(&ct).await.unwrap(), 2);
        assert_eq!(queue.dequeue(&ct).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_read_batch_of_one_ignores_timeout() {
        let queue = WorkQueue::new(4);
        let ct = token();
        queue.enqueue("only", &ct).await.unwrap();

        let batch = queue
            .read_batch(1, Duration::from_secs(3600), &ct)
            .await
            .unwrap();
        assert_eq!(batch, vec!["only"]);
    }

    #[tokio::test]
    async fn test_read_batch_zero_idle_returns_first_item() {
        let queue = WorkQueue::new(4);
        let ct = token();
        for i in 0..3 {
            queue.enqueue(i, &ct).await.unwrap();
        }

        // The first read blocks until an item exists; with a zero idle
        // timeout the subsequent reads give up immediately.
        let batch = queue
            .read_batch(3, Duration::from_millis(0), &ct)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_read_batch_collects_ready_items() {
        let queue = WorkQueue::new(16);
        let ct = token();
        for i in 0..10 {
            queue.enqueue(i, &ct).await.unwrap();
        }

        let batch = queue
            .read_batch(4, Duration::from_millis(100), &ct)
            .await
            .unwrap();
        assert_eq!(batch, vec![0, 1, 2, 3]);

        let rest = queue
            .read_batch(16, Duration::from_millis(20), &ct)
            .await
            .unwrap();
        assert_eq!(rest, vec![4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_read_batch_blocks_for_first_item() {
        let queue = Arc::new(WorkQueue::<u32>::new(4));
        let ct = token();

        let q = queue.clone();
        let reader = tokio::spawn({
            let ct = ct.clone();
            async move { q.read_batch(4, Duration::from_millis(10), &ct).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished(), "batch read should block while empty");

        queue.enqueue(99, &ct).await.unwrap();
        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch, vec![99]);
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let queue = Arc::new(WorkQueue::<u32>::new(4));
        let ct = token();

        let q = queue.clone();
        let reader = tokio::spawn({
            let ct = ct.clone();
            async move { q.read_batch(4, Duration::from_millis(10), &ct).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        ct.cancel();
        assert_eq!(reader.await.unwrap(), Err(QueueError::Cancelled));

        // Cancelled token also fails fresh reads immediately.
        assert_eq!(queue.dequeue(&ct).await, Err(QueueError::Cancelled));
        assert_eq!(queue.enqueue(1, &ct).await, Err(QueueError::Cancelled));
    }

    #[tokio::test]
    async fn test_capacity_is_clamped() {
        let queue = WorkQueue::<u32>::new(0);
        assert_eq!(queue.capacity(), 1);
    }
}
