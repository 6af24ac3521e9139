//! In-memory FIFO buffer between producers and the store worker
//!
//! `pop` never waits: an empty buffer is reported with [`BufferError::Empty`]
//! so the consumer can poll.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::item::LogItem;

/// Errors returned by [`Buffer::pop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("buffer is empty")]
    Empty,
}

/// Thread-safe FIFO queue of log items
///
/// With a capacity set, pushing onto a full buffer drops the oldest item.
#[derive(Debug)]
pub struct Buffer {
    items: Mutex<VecDeque<LogItem>>,
    /// Maximum items held; `None` is unbounded
    capacity: Option<usize>,
    /// Items discarded because the buffer was full
    dropped: AtomicU64,
}

impl Buffer {
    /// Create an unbounded buffer
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Create a buffer holding at most `capacity` items
    pub fn bounded(capacity: usize) -> Self {
        Self::new(Some(capacity.max(1)))
    }

    fn new(capacity: Option<usize>) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.unwrap_or(64))),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogItem>> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an item at the back
    pub fn push(&self, item: LogItem) {
        let mut items = self.lock();
        if let Some(cap) = self.capacity {
            while items.len() >= cap {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        items.push_back(item);
    }

    /// Remove the oldest item
    pub fn pop(&self) -> Result<LogItem, BufferError> {
        self.lock().pop_front().ok_or(BufferError::Empty)
    }

    /// Remove up to `max` items in FIFO order
    pub fn pop_batch(&self, max: usize) -> Vec<LogItem> {
        let mut items = self.lock();
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of items dropped on overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::unbounded()
    }
}
