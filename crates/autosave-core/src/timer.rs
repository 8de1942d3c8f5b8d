//! Cancellable deferred task on the tokio runtime.
//!
//! Scheduling replaces whatever was pending, which is what gives debounce
//! semantics. Once the delay has elapsed the task detaches from the timer:
//! cancelling or rescheduling afterwards never interrupts an action that
//! already started (e.g. an in-flight save).
//!
//! Delays use `tokio::time`, so tests can run on paused virtual time.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Slot {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

pub struct DebounceTimer {
    runtime: Handle,
    slot: Arc<Mutex<Slot>>,
}

impl DebounceTimer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Run `action` after `delay`, replacing any pending action.
    pub fn schedule<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;

        let shared = Arc::clone(&self.slot);
        slot.task = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = lock(&shared);
                if slot.generation != generation {
                    return;
                }
                // Detach: from here on the action runs to completion.
                slot.task = None;
            }
            action.await;
        }));
    }

    /// Drop the pending action, if any.
    pub fn cancel(&self) {
        let mut slot = lock(&self.slot);
        slot.generation += 1;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).task.is_some()
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock(slot: &Mutex<Slot>) -> std::sync::MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}
