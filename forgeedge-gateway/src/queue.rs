//! Bounded telemetry queue between the poll workers and the publisher
//!
//! - `enqueue` waits while the queue is full, fails once it is stopped
//! - `dequeue` waits while it is empty, drains what is left after a stop
//! - `stop` is idempotent and wakes every waiter
//!
//! The full queue is the backpressure: producers wait instead of the process
//! buffering without bound while the broker is unreachable.

use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("telemetry queue capacity must be at least 1")]
    ZeroCapacity,
    #[error("telemetry queue stopped")]
    Stopped,
}

/// One topic/payload pair in transit. Owned by exactly one party at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    topic: String,
    payload: String,
}

impl QueueItem {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn into_parts(self) -> (String, String) {
        (self.topic, self.payload)
    }
}

struct Ring {
    items: VecDeque<QueueItem>,
    running: bool,
}

pub struct TelemetryQueue {
    ring: Mutex<Ring>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl TelemetryQueue {
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }

        Ok(Self {
            ring: Mutex::new(Ring {
                items: VecDeque::with_capacity(capacity),
                running: true,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        })
    }

    /// Append an item, waiting for room while the queue is full.
    ///
    /// Fails immediately once the queue is stopped, full or not. Dropping the
    /// returned future while it waits drops the item.
    pub async fn enqueue(&self, item: QueueItem) -> Result<(), QueueError> {
        loop {
            // Interest is registered before the check: a dequeue or stop
            // landing between the check and the await still wakes us.
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut ring = self.ring.lock();
                if !ring.running {
                    return Err(QueueError::Stopped);
                }
                if ring.items.len() < self.capacity {
                    ring.items.push_back(item);
                    drop(ring);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Take the oldest item, waiting while the queue is empty and running.
    ///
    /// After a stop the remaining items are still returned in order; only an
    /// empty stopped queue reports `Stopped`. Cancel-safe: an item is removed
    /// only when the future completes.
    pub async fn dequeue(&self) -> Result<QueueItem, QueueError> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut ring = self.ring.lock();
                if let Some(item) = ring.items.pop_front() {
                    drop(ring);
                    self.not_full.notify_one();
                    return Ok(item);
                }
                if !ring.running {
                    return Err(QueueError::Stopped);
                }
            }

            notified.await;
        }
    }

    /// Refuse new items and wake all waiters. Irreversible.
    pub fn stop(&self) {
        self.ring.lock().running = false;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        !self.ring.lock().running
    }

    pub fn len(&self) -> usize {
        self.ring.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
