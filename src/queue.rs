use crate::sensors::SensorSample;
use heapless::Deque;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

pub const MIN_QUEUE_CAPACITY: usize = 8;
pub const MAX_QUEUE_CAPACITY: usize = 32;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

const_assert!(DEFAULT_QUEUE_CAPACITY >= MIN_QUEUE_CAPACITY);
const_assert!(DEFAULT_QUEUE_CAPACITY <= MAX_QUEUE_CAPACITY);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue capacity {requested} outside {min}..={max}")]
    InvalidCapacity {
        requested: usize,
        min: usize,
        max: usize,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pushed: u32,
    pub evicted: u32,
    pub popped: u32,
}

/// Bounded sample handoff between the sensor task and the session task.
///
/// One producer pushes, one consumer pops. A push into a full queue evicts the
/// oldest retained sample, so the newest reading is never lost. The internal
/// lock is only held for the O(1) deque operation and never across an await.
#[derive(Debug)]
pub struct SampleQueue {
    entries: Mutex<Deque<SensorSample, MAX_QUEUE_CAPACITY>>,
    capacity: usize,
    available: Notify,
    pushed: AtomicU32,
    evicted: AtomicU32,
    popped: AtomicU32,
}

impl SampleQueue {
    pub fn with_capacity(capacity: usize) -> Result<Self, QueueError> {
        if !(MIN_QUEUE_CAPACITY..=MAX_QUEUE_CAPACITY).contains(&capacity) {
            return Err(QueueError::InvalidCapacity {
                requested: capacity,
                min: MIN_QUEUE_CAPACITY,
                max: MAX_QUEUE_CAPACITY,
            });
        }

        Ok(Self {
            entries: Mutex::new(Deque::new()),
            capacity,
            available: Notify::new(),
            pushed: AtomicU32::new(0),
            evicted: AtomicU32::new(0),
            popped: AtomicU32::new(0),
        })
    }

    /// Inserts a sample, returning the evicted oldest sample when the queue
    /// was full. Never blocks beyond the deque lock.
    pub fn push(&self, sample: SensorSample) -> Option<SensorSample> {
        let evicted = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = if entries.len() >= self.capacity {
                entries.pop_front()
            } else {
                None
            };
            // Capacity is bounded by MAX_QUEUE_CAPACITY, so there is always room here
            let _ = entries.push_back(sample);
            evicted
        };

        self.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.available.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<SensorSample> {
        let sample = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if sample.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        sample
    }

    /// Waits up to `timeout` for a sample. `None` means the period was empty.
    pub async fn pop(&self, timeout: Duration) -> Option<SensorSample> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            if let Some(sample) = self.try_pop() {
                return Some(sample);
            }
            if time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
        }
    }
}
