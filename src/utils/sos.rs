use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pipeline::sync::Monitor;

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Identifies a hook registered with [`SignalOfStop::on_cancel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

/// Cancellation token shared between whoever owns the process-level
/// interrupt (Ctrl-C handler, a timer, a supervisor) and the pipeline
pub struct SignalOfStop {
    // Shared state between clones
    shared: Arc<Monitor<SharedState>>,
}

#[derive(Default)]
struct SharedState {
    closing: bool,
    next_hook: u64,
    hooks: Vec<(HookId, Hook)>,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            shared: Arc::new(Monitor::new(SharedState::default())),
        }
    }

    /// Request a stop. Only the first call runs the registered hooks.
    pub fn cancel(&self) {
        let hooks: Vec<Hook> = {
            let mut state = self.shared.lock();
            if state.closing {
                return;
            }
            state.closing = true;

            // Notify all threads waiting on the condition variable
            state.signal_all();
            state.hooks.drain(..).map(|(_, hook)| hook).collect()
        };

        // Hooks run outside the lock: they may take other locks of their own
        for hook in hooks {
            hook();
        }
    }

    pub fn cancelled(&self) -> bool {
        self.shared.lock().closing
    }

    /// Block until [`cancel`](Self::cancel) has been called
    pub fn wait_cancellation(&self) {
        let mut state = self.shared.lock();
        while !state.closing {
            state = state.wait(); // Wait releases the lock, then reacquires it when notified
        }
    }

    /// Block until cancelled or `timeout` elapsed; returns whether it was cancelled
    pub fn wait_cancellation_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while !state.closing {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = state.wait_timeout(deadline - now);
            state = next;
        }
        true
    }

    /// Run `hook` once when the signal fires
    ///
    /// If the signal already fired the hook runs immediately, on this thread.
    pub fn on_cancel<F>(&self, hook: F) -> HookId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = self.shared.lock();
        let id = HookId(state.next_hook);
        state.next_hook += 1;

        if state.closing {
            state.unlock();
            hook();
        } else {
            state.hooks.push((id, Arc::new(hook)));
        }
        id
    }

    /// Unregister a hook that has not fired yet
    pub fn remove_hook(&self, id: HookId) {
        self.shared.lock().hooks.retain(|(hook_id, _)| *hook_id != id);
    }
}

impl Default for SignalOfStop {
    fn default() -> Self {
        Self::new()
    }
}

// Implementing the Clone trait
impl Clone for SignalOfStop {
    fn clone(&self) -> SignalOfStop {
        SignalOfStop {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for SignalOfStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalOfStop")
            .field("cancelled", &self.cancelled())
            .finish()
    }
}
