//! Single-producer / single-consumer hand-off queue between two stages
//!
//! The item sequence and the terminated flag live under the same lock, so a
//! consumer always observes both together. Pops block until an item arrives
//! or the queue is terminated; a terminated queue still hands out whatever it
//! holds until it is genuinely empty.

use log::{trace, warn};
use std::collections::VecDeque;

use super::sync::Monitor;

struct QueueState<T> {
    items: VecDeque<T>,
    terminated: bool,
    high_water: usize,
    /// Depth at which the next growth warning fires
    next_warning: usize,
}

/// Unbounded FIFO channel with blocking pop and wake-on-terminate
pub struct StageQueue<T> {
    name: String,
    state: Monitor<QueueState<T>>,
}

impl<T> StageQueue<T> {
    /// Create an empty queue that warns once its depth reaches `warn_depth`
    /// (and again every time the depth doubles from there)
    pub fn new(name: impl Into<String>, warn_depth: usize) -> Self {
        Self {
            name: name.into(),
            state: Monitor::new(QueueState {
                items: VecDeque::new(),
                terminated: false,
                high_water: 0,
                next_warning: warn_depth.max(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Change the depth at which the next growth warning fires
    pub fn set_warn_depth(&self, warn_depth: usize) {
        self.state.lock().next_warning = warn_depth.max(1);
    }

    /// Append an item at the tail and wake the consumer. Never blocks.
    ///
    /// Pushing onto a terminated queue is accepted; the consumer drains it
    /// or the orchestrator discards it once every stage has exited. Returns
    /// whether this push logged a growth warning.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        let warned = self.enqueue(&mut state, item);
        state.signal();
        warned
    }

    /// Push only while the queue is still open
    ///
    /// The terminated flag is checked under the same lock as the append, so
    /// a refused item can never be left behind for a consumer that already
    /// saw the end. A refused item is handed back.
    pub fn push_open(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.terminated {
            return Err(item);
        }
        self.enqueue(&mut state, item);
        state.signal();
        Ok(())
    }

    fn enqueue(&self, state: &mut QueueState<T>, item: T) -> bool {
        state.items.push_back(item);

        let depth = state.items.len();
        if depth > state.high_water {
            state.high_water = depth;
        }
        if depth < state.next_warning {
            return false;
        }
        warn!(
            "StageQueue {}: depth reached {} items (consumer is falling behind)",
            self.name, depth
        );
        state.next_warning = state.next_warning.saturating_mul(2);
        true
    }

    /// Block until an item is available or the queue is terminated
    ///
    /// Returns `None` only when the queue is terminated *and* empty.
    pub fn wait_and_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        while state.items.is_empty() && !state.terminated {
            state = state.wait();
        }
        let item = state.items.pop_front();
        if item.is_none() {
            trace!("StageQueue {}: terminated and drained", self.name);
        }
        item
    }

    /// Pop the head item without blocking
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Mark the queue terminated and wake every waiter. Idempotent.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        if !state.terminated {
            state.terminated = true;
            trace!(
                "StageQueue {}: terminated with {} items pending",
                self.name,
                state.items.len()
            );
        }
        state.signal_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Largest depth the queue has reached
    pub fn high_water(&self) -> usize {
        self.state.lock().high_water
    }

    /// Depth at which the next growth warning fires
    pub fn next_warning(&self) -> usize {
        self.state.lock().next_warning
    }

    /// Remove and drop every item still queued, returning how many there were
    pub fn discard(&self) -> usize {
        let drained: Vec<T> = {
            let mut state = self.state.lock();
            state.items.drain(..).collect()
        };
        // Items are released outside the lock
        drained.len()
    }
}

/// Type-erased view of a queue used by the orchestrator
pub trait QueueControl: Send + Sync {
    fn name(&self) -> &str;
    fn set_warn_depth(&self, warn_depth: usize);
    fn terminate(&self);
    fn is_terminated(&self) -> bool;
    fn len(&self) -> usize;
    fn high_water(&self) -> usize;
    fn next_warning(&self) -> usize;
    fn discard(&self) -> usize;
}

impl<T: Send> QueueControl for StageQueue<T> {
    fn name(&self) -> &str {
        StageQueue::name(self)
    }

    fn set_warn_depth(&self, warn_depth: usize) {
        StageQueue::set_warn_depth(self, warn_depth)
    }

    fn terminate(&self) {
        StageQueue::terminate(self)
    }

    fn is_terminated(&self) -> bool {
        StageQueue::is_terminated(self)
    }

    fn len(&self) -> usize {
        StageQueue::len(self)
    }

    fn high_water(&self) -> usize {
        StageQueue::high_water(self)
    }

    fn next_warning(&self) -> usize {
        StageQueue::next_warning(self)
    }

    fn discard(&self) -> usize {
        StageQueue::discard(self)
    }
}
