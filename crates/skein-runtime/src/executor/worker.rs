//! Executor worker threads
//!
//! A worker counts as free while it waits and active while it runs a job.
//! It leaves the pool in exactly two cases:
//!
//! - idle wait timed out, queue empty, pool Running and above `low_watermark`
//! - pool Stopping and queue empty
//!
//! Either way it drops its own entry from the worker set under the lock;
//! the last one out of a Stopping pool marks it Stopped.

use super::{Inner, Job, Shared};
use crate::panic_message;

use parking_lot::MutexGuard;
use skein_core::error::PoolError;
use skein_core::id::WorkerId;
use skein_core::state::PoolState;
use skein_core::{kdebug, kerror, ktrace};

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

thread_local! {
    /// Pool this thread works for, 0 when not a worker
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

/// Whether the calling thread is one of `shared`'s workers
pub(crate) fn on_worker_of(shared: &Arc<Shared>) -> bool {
    CURRENT_POOL.with(|c| c.get() == Arc::as_ptr(shared) as usize)
}

/// Start one worker; counted as free from this point
///
/// Also reaps handles of workers that retired and have since exited.
pub(crate) fn spawn(shared: &Arc<Shared>, inner: &mut Inner) -> Result<WorkerId, PoolError> {
    if inner.retired.iter().any(|h| h.is_finished()) {
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.retired)
            .into_iter()
            .partition(|h| h.is_finished());
        inner.retired = pending;
        for h in done {
            let _ = h.join();
        }
    }

    let id = WorkerId::new(inner.next_worker_id);
    inner.next_worker_id += 1;

    let s = shared.clone();
    let handle = thread::Builder::new()
        .name(format!("{}-{}", shared.config.name, id.as_u64()))
        .spawn(move || run(s, id))
        .map_err(|e| PoolError::SpawnFailed(e.to_string()))?;

    inner.free_threads += 1;
    inner.workers.insert(id, handle);
    ktrace!("spawned worker {} ({} threads)", id, inner.thread_count());
    Ok(id)
}

fn run(shared: Arc<Shared>, id: WorkerId) {
    CURRENT_POOL.with(|c| c.set(Arc::as_ptr(&shared) as usize));

    let idle_timeout = shared.config.idle_timeout;
    let low = shared.config.low_watermark;

    let mut inner = shared.inner.lock();
    loop {
        if let Some(job) = inner.queue.pop_front() {
            inner.free_threads -= 1;
            inner.active_threads += 1;
            MutexGuard::unlocked(&mut inner, || run_job(id, job));
            inner.active_threads -= 1;
            inner.free_threads += 1;
            continue;
        }

        if inner.state != PoolState::Running {
            break;
        }

        let timed_out = shared
            .work_available
            .wait_for(&mut inner, idle_timeout)
            .timed_out();
        if timed_out
            && inner.queue.is_empty()
            && inner.state == PoolState::Running
            && inner.thread_count() > low
        {
            kdebug!("worker {} idle, retiring", id);
            break;
        }
    }

    inner.free_threads -= 1;
    if let Some(handle) = inner.workers.remove(&id) {
        inner.retired.push(handle);
    }
    if inner.thread_count() == 0 && inner.state == PoolState::Stopping {
        inner.state = PoolState::Stopped;
        kdebug!("last worker {} out, executor stopped", id);
        shared.stopped.notify_all();
    }
}

fn run_job(id: WorkerId, job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        kerror!("worker {}: task panicked: {}", id, panic_message(payload.as_ref()));
    }
}
