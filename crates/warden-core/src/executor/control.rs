//! ExecutorControl - executor と governance が共有する唯一の状態
//!
//! `concurrency_limit` と `paused` の 2 つだけを 1 つの Mutex で守ります。
//! Governance 側は `update()` で読み取りと書き込みを同じロック区間で行うため、
//! read-modify-write の競合は起きません。変更のたびに `Notify` で dispatcher を起こします。

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::Notify;

/// Actuator state at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlSnapshot {
    pub limit: usize,
    pub paused: bool,
}

#[derive(Debug)]
pub struct ExecutorControl {
    state: Mutex<ControlSnapshot>,
    max_limit: usize,
    changed: Notify,
}

impl ExecutorControl {
    /// Starts unpaused at `max_limit`.
    pub fn new(max_limit: usize) -> Self {
        let max_limit = max_limit.max(1);
        Self {
            state: Mutex::new(ControlSnapshot {
                limit: max_limit,
                paused: false,
            }),
            max_limit,
            changed: Notify::new(),
        }
    }

    pub fn max_limit(&self) -> usize {
        self.max_limit
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        *self.lock()
    }

    /// Mutate both fields under one lock. The limit is clamped to `[1, max_limit]`.
    pub fn update<R>(&self, f: impl FnOnce(&mut ControlSnapshot) -> R) -> R {
        let (result, changed) = {
            let mut state = self.lock();
            let before = *state;
            let result = f(&mut state);
            state.limit = state.limit.clamp(1, self.max_limit);
            (result, *state != before)
        };
        if changed {
            self.changed.notify_waiters();
        }
        result
    }

    pub fn set_limit(&self, limit: usize) {
        self.update(|state| state.limit = limit);
    }

    pub fn set_paused(&self, paused: bool) {
        self.update(|state| state.paused = paused);
    }

    /// Resolves on the next change made after this call.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, ControlSnapshot> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
