// src/engine/queue.rs

//! Ready-queue shared between the instance and the executor.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::errors::{EngineError, Result};
use crate::types::TaskName;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<TaskName>,
    terminated: bool,
}

/// Multi-producer multi-consumer queue of tasks ready to run.
///
/// Termination is distinct from emptiness: once terminated, consumers drain
/// what is left and then get `Ok(None)`.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` if the queue was already terminated.
    pub fn push(&self, task: TaskName) -> bool {
        {
            let mut state = self.lock();
            if state.terminated {
                return false;
            }
            state.items.push_back(task);
        }
        self.notify.notify_one();
        true
    }

    /// Returns `true` only for the call that actually terminated the queue.
    pub fn terminate(&self) -> bool {
        let first = {
            let mut state = self.lock();
            !std::mem::replace(&mut state.terminated, true)
        };
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Take everything still queued without waiting.
    pub fn drain(&self) -> Vec<TaskName> {
        self.lock().items.drain(..).collect()
    }

    fn try_dequeue(&self) -> Option<Option<TaskName>> {
        let mut state = self.lock();
        match state.items.pop_front() {
            Some(task) => Some(Some(task)),
            None if state.terminated => Some(None),
            None => None,
        }
    }

    /// Wait for the next ready task.
    ///
    /// `Ok(None)` means the queue was terminated and is empty.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<TaskName>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if let Some(next) = self.try_dequeue() {
                return Ok(next);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }
}
