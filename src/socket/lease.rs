//! Lease admission: time- and count-bounded request budgets.
//!
//! Each connection with leasing enabled tracks two budgets. The *received*
//! budget gates outgoing requests (a request with no live lease fails
//! locally, nothing touches the wire). The *issued* budget mirrors the LEASE
//! frames we sent and gates incoming requests, answered with
//! ERROR(REJECTED) when not covered.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// One direction's lease budget.
#[derive(Debug)]
pub struct LeaseState {
    remaining: AtomicI64,
    deadline: Mutex<Option<Instant>>,
}

impl LeaseState {
    /// Create an empty budget: every admission check fails until armed.
    pub fn new() -> Self {
        Self {
            remaining: AtomicI64::new(0),
            deadline: Mutex::new(None),
        }
    }

    /// Install a fresh lease, replacing any previous one.
    pub fn arm(&self, ttl: Duration, number_of_requests: u32) {
        *self.deadline.lock().expect("lease lock") = Some(Instant::now() + ttl);
        self.remaining
            .store(i64::from(number_of_requests), Ordering::Release);
    }

    /// Consume one request from the budget.
    ///
    /// Returns false when the lease is exhausted, expired, or never armed.
    pub fn try_use(&self) -> bool {
        let live = self
            .deadline
            .lock()
            .expect("lease lock")
            .map(|d| Instant::now() < d)
            .unwrap_or(false);
        if !live {
            return false;
        }
        self.remaining.fetch_sub(1, Ordering::AcqRel) > 0
    }

    /// Requests left on the current lease (may be stale immediately).
    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }
}

impl Default for LeaseState {
    fn default() -> Self {
        Self::new()
    }
}
