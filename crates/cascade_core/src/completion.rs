//! Completion handles for operations that finish later.
//!
//! Every operation that may wait (a batch flush, an index pass, a
//! downstream refresh) hands out a [`CompletionHandle`]; the owner keeps
//! the matching [`Completion`] and resolves it exactly once. Handles are
//! cheap to clone and safe to wait on from any thread, including after
//! resolution.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct Latch {
    done: Mutex<bool>,
    signal: Condvar,
}

/// The resolving half of a completion.
#[derive(Debug)]
pub struct Completion {
    latch: Arc<Latch>,
}

/// The waiting half of a completion.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    latch: Arc<Latch>,
}

impl Completion {
    /// Creates a fresh completion and its handle.
    #[must_use]
    pub fn new() -> (Self, CompletionHandle) {
        let latch = Arc::new(Latch {
            done: Mutex::new(false),
            signal: Condvar::new(),
        });
        (
            Self {
                latch: Arc::clone(&latch),
            },
            CompletionHandle { latch },
        )
    }

    /// Resolves the completion, waking every waiter.
    ///
    /// Resolving more than once is a no-op.
    pub fn complete(&self) {
        let mut done = self.latch.done.lock();
        if !*done {
            *done = true;
            self.latch.signal.notify_all();
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        // A dropped resolver must not wedge waiters.
        self.complete();
    }
}

impl CompletionHandle {
    /// Returns an already-resolved handle.
    #[must_use]
    pub fn resolved() -> Self {
        Self {
            latch: Arc::new(Latch {
                done: Mutex::new(true),
                signal: Condvar::new(),
            }),
        }
    }

    /// Blocks until the completion resolves.
    pub fn wait(&self) {
        let mut done = self.latch.done.lock();
        while !*done {
            self.latch.signal.wait(&mut done);
        }
    }

    /// Blocks until resolution or `timeout`, returning whether the
    /// completion resolved.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.latch.done.lock();
        if *done {
            return true;
        }
        self.latch.signal.wait_for(&mut done, timeout);
        *done
    }

    /// Returns whether the completion has resolved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.latch.done.lock()
    }
}
