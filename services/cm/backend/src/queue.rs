//! Bounded task queue shared by the backend workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::tasks::BackendTask;

/// Why a task could not be queued
#[derive(Debug)]
pub enum PushError {
    /// The queue is at capacity
    Full(BackendTask),
    /// The queue no longer accepts tasks
    Closed(BackendTask),
}

/// FIFO of [`BackendTask`]s with a fixed capacity
#[derive(Debug)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<BackendTask>>,
    capacity: usize,
    available: Notify,
    closed: AtomicBool,
}

impl TaskQueue {
    /// Create a queue holding at most `capacity` tasks
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<BackendTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a task, handing it back when the queue is full or closed
    pub fn try_push(&self, task: BackendTask) -> Result<(), PushError> {
        if self.is_closed() {
            return Err(PushError::Closed(task));
        }
        {
            let mut tasks = self.lock();
            if tasks.len() >= self.capacity {
                return Err(PushError::Full(task));
            }
            tasks.push_back(task);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Next task; `None` once the queue is closed and empty
    pub async fn pop(&self) -> Option<BackendTask> {
        loop {
            let notified = self.available.notified();
            if let Some(task) = self.lock().pop_front() {
                return Some(task);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting tasks; queued tasks can still be popped
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
    }

    /// True once [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remove and return every queued task
    pub fn drain(&self) -> Vec<BackendTask> {
        self.lock().drain(..).collect()
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
