//! Cooperative stop barrier shared by the workers of a model.
//!
//! Workers `register` before they start. `stop` issues one token per worker that
//! has not yet left; each worker consumes its token with `try_stop` at its own
//! checkpoints and exits. A worker that leaves for another reason (end of stream)
//! calls `retire` instead. `wait` returns once every worker has done one or the
//! other.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct State {
    workers: usize,
    acked: usize,
    tokens: usize,
    stopped: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

#[derive(Debug, Clone, Default)]
pub struct Signal {
    shared: Arc<Shared>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one worker. Call before the worker starts.
    pub fn register(&self) {
        self.lock().workers += 1;
    }

    pub fn workers(&self) -> usize {
        self.lock().workers
    }

    /// Issue a stop token to every worker still running. Idempotent.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.stopped = true;
        state.tokens = state.workers.saturating_sub(state.acked);
        self.shared.changed.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Consume a pending stop token. Returns true at most once per worker, after
    /// which the worker must exit without calling `retire`.
    pub fn try_stop(&self) -> bool {
        let mut state = self.lock();
        if state.tokens == 0 {
            return false;
        }
        state.tokens -= 1;
        state.acked += 1;
        self.shared.changed.notify_all();
        true
    }

    /// Record that a worker exited without consuming a stop token.
    pub fn retire(&self) {
        let mut state = self.lock();
        state.acked += 1;
        state.tokens = state.tokens.saturating_sub(1);
        self.shared.changed.notify_all();
    }

    /// Block until every registered worker has stopped or retired.
    pub fn wait(&self) {
        let mut state = self.lock();
        while state.acked < state.workers {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. Returns true if every
    /// worker acknowledged in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.acked < state.workers {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
