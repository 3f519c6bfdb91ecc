use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting limit on enricher calls in flight.
///
/// The permit travels with the thread that runs the call and is released
/// when the enricher returns, so a call abandoned after a timeout keeps its
/// slot until it actually finishes.
#[derive(Debug)]
pub struct CallLimit {
    capacity: usize,
    available: Mutex<usize>,
    released: Condvar,
}

impl CallLimit {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            capacity,
            available: Mutex::new(capacity),
            released: Condvar::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.available
            .lock()
            .map(|available| self.capacity - *available)
            .unwrap_or(self.capacity)
    }

    /// Wait up to `timeout` for a free slot.
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Option<CallPermit> {
        let deadline = Instant::now() + timeout;
        let mut available = self.available.lock().ok()?;
        while *available == 0 {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self.released.wait_timeout(available, remaining).ok()?;
            available = guard;
        }
        *available -= 1;
        Some(CallPermit {
            limit: Arc::clone(self),
        })
    }

    fn release(&self) {
        if let Ok(mut available) = self.available.lock() {
            *available = (*available + 1).min(self.capacity);
            self.released.notify_one();
        }
    }
}

/// One slot of a [`CallLimit`], returned on drop.
#[derive(Debug)]
pub struct CallPermit {
    limit: Arc<CallLimit>,
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        self.limit.release();
    }
}
