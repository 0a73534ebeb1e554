//! The shared upload-memory budget.
//!
//! Every segment repair reserves its buffer memory up front and releases it
//! when the segment completes or fails. Requests block until enough memory
//! frees up; priority requests jump the queue but draw from the same
//! budget. A request larger than the whole budget is granted only when the
//! manager is completely idle, so oversized segments still make progress
//! instead of deadlocking.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

struct Waiter {
    amount: u64,
    notify: oneshot::Sender<()>,
}

struct MemState {
    capacity: u64,
    available: u64,
    priority_waiters: VecDeque<Waiter>,
    waiters: VecDeque<Waiter>,
    stopped: bool,
}

impl MemState {
    fn can_grant(&self, amount: u64) -> bool {
        amount <= self.available || (amount >= self.capacity && self.available == self.capacity)
    }

    fn deduct(&mut self, amount: u64) {
        self.available -= amount.min(self.capacity);
    }
}

/// The memory budget manager.
pub struct MemoryManager {
    state: Mutex<MemState>,
}

impl MemoryManager {
    pub fn new(capacity: u64) -> Self {
        Self {
            state: Mutex::new(MemState {
                capacity,
                available: capacity,
                priority_waiters: VecDeque::new(),
                waiters: VecDeque::new(),
                stopped: false,
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.state.lock().capacity
    }

    pub fn available(&self) -> u64 {
        self.state.lock().available
    }

    /// Reserve `amount` bytes, blocking until they are available. Returns
    /// false when the manager was stopped before the grant.
    ///
    /// Callers must hold no other resources while waiting.
    pub async fn request(&self, amount: u64, priority: bool) -> bool {
        let receiver = {
            let mut state = self.state.lock();
            if state.stopped {
                return false;
            }
            if state.can_grant(amount) {
                state.deduct(amount);
                return true;
            }
            let (tx, rx) = oneshot::channel();
            let waiter = Waiter { amount, notify: tx };
            if priority {
                state.priority_waiters.push_back(waiter);
            } else {
                state.waiters.push_back(waiter);
            }
            rx
        };
        receiver.await.is_ok()
    }

    /// Return `amount` bytes and wake whoever can now be served, priority
    /// lane first, FIFO within each lane.
    pub fn release(&self, amount: u64) {
        let mut state = self.state.lock();
        state.available = (state.available + amount.min(state.capacity)).min(state.capacity);

        loop {
            let use_priority = !state.priority_waiters.is_empty();
            let front_amount = {
                let lane = if use_priority {
                    &state.priority_waiters
                } else {
                    &state.waiters
                };
                match lane.front() {
                    Some(waiter) => waiter.amount,
                    None => break,
                }
            };
            if !state.can_grant(front_amount) {
                break;
            }
            let waiter = if use_priority {
                state.priority_waiters.pop_front()
            } else {
                state.waiters.pop_front()
            }
            .expect("front checked above");
            state.deduct(front_amount);
            if waiter.notify.send(()).is_err() {
                // The requester gave up; its reservation returns immediately
                state.available =
                    (state.available + front_amount.min(state.capacity)).min(state.capacity);
            }
        }
    }

    /// Refuse all pending and future requests.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.priority_waiters.clear();
        state.waiters.clear();
    }
}
