// SPDX-License-Identifier: Apache-2.0

//! One-shot agent start-up, triggered lazily by the first admitted request.
//! `monitor()` is synchronous end-to-end, so completion is signalled with a
//! condition variable rather than an async future — a request that needs to
//! wait blocks the calling thread briefly instead of requiring a runtime.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex,
};
use std::thread;

use tracing::warn;

/// Tracks whether the agent's own start-up routine has run, triggering it
/// at most once across concurrent first callers.
pub struct Startup {
    triggered: AtomicBool,
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Startup {
    pub fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            state: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn is_complete(&self) -> bool {
        *self.state.0.lock().unwrap()
    }

    /// If start-up has not yet been triggered, spawns it on a background
    /// thread and returns `true` — the caller should mark its frame as
    /// awaiting start-up so `monitorStop` waits for completion.
    pub fn trigger_if_needed(&self, routine: impl FnOnce() + Send + 'static) -> bool {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return false;
        }
        let state = self.state.clone();
        thread::spawn(move || {
            routine();
            let (lock, cvar) = &*state;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        });
        true
    }

    /// Blocks the calling thread until start-up completes. Swallows a
    /// poisoned lock (the start-up thread panicked) by logging and treating
    /// start-up as complete — instrumentation failures never abort the
    /// workload.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.state;
        let mut done = lock.lock().unwrap_or_else(|poisoned| {
            warn!("start-up thread panicked; treating start-up as complete");
            poisoned.into_inner()
        });
        while !*done {
            let result = cvar.wait(done).unwrap_or_else(|poisoned| poisoned.into_inner());
            done = result;
        }
    }
}

impl Default for Startup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn trigger_runs_exactly_once_across_concurrent_callers() {
        let startup = Arc::new(Startup::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let startup = startup.clone();
                let runs = runs.clone();
                thread::spawn(move || {
                    startup.trigger_if_needed(move || {
                        runs.fetch_add(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        startup.wait();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(startup.is_complete());
    }

    #[test]
    fn wait_returns_immediately_once_complete() {
        let startup = Startup::new();
        startup.trigger_if_needed(|| {});
        startup.wait();
        startup.wait();
    }
}
