//! Bounded-wait producer/consumer queue for progress notifications.
//!
//! A [`Monitor`] is shared between one producer (a download worker) and a
//! polling consumer. Producers never block on the consumer; consumers never
//! wait longer than the timeout they pass in.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Thread-safe FIFO with timed receive.
#[derive(Debug)]
pub struct Monitor<T> {
    queue: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> Default for Monitor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Monitor<T> {
    /// Creates an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    // A poisoned queue still holds valid notifications; keep serving them.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Appends a value and wakes one waiting consumer.
    pub fn push(&self, value: T) {
        self.lock().push_back(value);
        self.available.notify_one();
    }

    /// Pops the oldest value without waiting.
    pub fn get(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Pops the oldest value, waiting at most `timeout` for one to arrive.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();

        loop {
            if let Some(value) = queue.pop_front() {
                return Some(value);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let (guard, _) = self
                .available
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            queue = guard;
        }
    }

    /// Removes and returns everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
