//! One in-flight task per file, last event wins.
//!
//! Registering a key that already has a live task cancels the old task's
//! token and replaces the entry in one step under the map lock. The old task
//! may keep running until it reaches its next cancellation checkpoint; its
//! late completion never removes the newer entry because removal compares
//! task ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::mapping::FileKey;
use crate::pool::WorkerPool;

/// How a per-file task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The ledger already holds this exact file state
    AlreadyProcessed,
    /// Still being written when the stability budget ran out
    Unstable,
    /// Another process holds a lock on the file
    Locked,
    /// The file disappeared before it could be processed
    Vanished,
    /// Uploaded and recorded
    Transferred { remote: String },
    /// Upload or I/O failure; a later event will retry naturally
    Failed { error: String },
    /// Superseded by a newer event for the same file, or shut down
    Cancelled,
}

#[derive(Debug, Default)]
struct Completion {
    outcome: Mutex<Option<TaskOutcome>>,
    finished: Condvar,
}

/// Handle to a registered task. Clone is cheap and shares state.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    key: FileKey,
    id: u64,
    cancel: CancellationToken,
    completion: Arc<Completion>,
}

impl TaskHandle {
    pub fn key(&self) -> &FileKey {
        &self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.lock_outcome().is_some()
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.lock_outcome().clone()
    }

    /// Block until the task finishes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        let guard = self.lock_outcome();
        let (guard, _) = self
            .completion
            .finished
            .wait_timeout_while(guard, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }

    fn finish(&self, outcome: TaskOutcome) {
        let mut guard = self.lock_outcome();
        if guard.is_none() {
            *guard = Some(outcome);
        }
        self.completion.finished.notify_all();
    }

    fn lock_outcome(&self) -> MutexGuard<'_, Option<TaskOutcome>> {
        self.completion
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Result of registering a new task for a key
#[derive(Debug)]
pub struct Registration {
    pub handle: TaskHandle,
    /// The live task this registration replaced (already signalled to stop)
    pub superseded: Option<TaskHandle>,
}

/// In-memory map of live tasks, keyed by file.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<FileKey, TaskHandle>>,
    next_id: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically cancel any live task for `key` and register a new one.
    pub fn register(&self, key: FileKey) -> Registration {
        let handle = TaskHandle {
            key: key.clone(),
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            cancel: CancellationToken::new(),
            completion: Arc::new(Completion::default()),
        };

        let superseded = self.lock_tasks().insert(key, handle.clone());
        if let Some(old) = superseded.as_ref() {
            old.cancel();
            debug!(path = %old.key, task = old.id, "Cancelled existing task for file");
        }

        Registration { handle, superseded }
    }

    /// Record the task's outcome and drop its entry, unless a newer task has
    /// taken the key since. Returns whether the entry was removed.
    pub fn complete(&self, handle: &TaskHandle, outcome: TaskOutcome) -> bool {
        let removed = {
            let mut tasks = self.lock_tasks();
            match tasks.get(&handle.key) {
                Some(current) if current.id == handle.id => {
                    tasks.remove(&handle.key);
                    true
                }
                _ => false,
            }
        };
        handle.finish(outcome);
        removed
    }

    /// Register `work` under `key` and hand it to `pool`.
    ///
    /// The entry is removed when the work returns, panics, or is dropped
    /// unrun. If the pool is saturated the work runs on the calling thread
    /// before this returns.
    pub fn submit<F>(self: &Arc<Self>, key: FileKey, pool: &WorkerPool, work: F) -> Result<Registration>
    where
        F: FnOnce(&CancellationToken) -> TaskOutcome + Send + 'static,
    {
        let registration = self.register(key);
        let guard = CompletionGuard {
            registry: Arc::clone(self),
            handle: registration.handle.clone(),
        };

        pool.execute(move || {
            let token = guard.handle.cancel.clone();
            let outcome = work(&token);
            guard.finish(outcome);
        })?;

        Ok(registration)
    }

    pub fn get(&self, key: &FileKey) -> Option<TaskHandle> {
        self.lock_tasks().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_tasks().is_empty()
    }

    /// Signal every live task to stop.
    pub fn cancel_all(&self) -> usize {
        let tasks = self.lock_tasks();
        for handle in tasks.values() {
            handle.cancel();
        }
        tasks.len()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<FileKey, TaskHandle>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Completes the registry entry however the work ends.
struct CompletionGuard {
    registry: Arc<TaskRegistry>,
    handle: TaskHandle,
}

impl CompletionGuard {
    fn finish(self, outcome: TaskOutcome) {
        self.registry.complete(&self.handle, outcome);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.handle.is_finished() {
            return;
        }
        let outcome = if std::thread::panicking() {
            TaskOutcome::Failed {
                error: "task panicked".to_string(),
            }
        } else {
            TaskOutcome::Cancelled
        };
        self.registry.complete(&self.handle, outcome);
    }
}
