//! Result handle for submitted tasks

use parking_lot::{Condvar, Mutex};
use skein_core::error::TaskError;
use std::sync::Arc;

struct Slot<T> {
    value: Mutex<Option<Result<T, TaskError>>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn set(&self, result: Result<T, TaskError>) {
        *self.value.lock() = Some(result);
        self.ready.notify_all();
    }
}

/// Producer half, moved into the queued job
///
/// Dropping it without completing reports `TaskError::Dropped`.
pub(crate) struct Promise<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Promise<T> {
    pub fn complete(mut self, result: Result<T, TaskError>) {
        if let Some(slot) = self.slot.take() {
            slot.set(result);
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.set(Err(TaskError::Dropped));
        }
    }
}

/// Handle to the outcome of [`Executor::submit`](super::Executor::submit)
pub struct TaskHandle<T> {
    slot: Arc<Slot<T>>,
}

pub(crate) fn channel<T>() -> (Promise<T>, TaskHandle<T>) {
    let slot = Arc::new(Slot {
        value: Mutex::new(None),
        ready: Condvar::new(),
    });
    (Promise { slot: Some(slot.clone()) }, TaskHandle { slot })
}

impl<T> TaskHandle<T> {
    /// Block until the task ran (or was discarded)
    pub fn join(self) -> Result<T, TaskError> {
        let mut value = self.slot.value.lock();
        loop {
            if let Some(result) = value.take() {
                return result;
            }
            self.slot.ready.wait(&mut value);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.slot.value.lock().is_some()
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}
