//! Dynamic worker thread pool
//!
//! One mutex guards the whole pool state: lifecycle flag, FIFO queue,
//! thread counters and the worker set. Workers wait on `work_available`
//! with a bounded wait (`idle_timeout`) so surplus threads can notice they
//! are idle; `stop(true)` waits on `stopped`.
//!
//! ```text
//!   Idle --start--> Running --stop--> Stopping --last worker out--> Stopped
//!     \_______________________stop_______________________________/
//! ```
//!
//! Sizing: growth happens on submission when the queue is non-empty, no
//! thread is free and fewer than `high_watermark` exist; shrinking happens
//! when a worker's idle wait times out with more than `low_watermark`
//! threads alive.

mod handle;
mod worker;

pub use handle::TaskHandle;

use crate::config::ExecutorConfig;
use crate::panic_message;

use parking_lot::{Condvar, Mutex};
use skein_core::error::{PoolError, PoolResult, TaskError};
use skein_core::id::WorkerId;
use skein_core::state::PoolState;
use skein_core::{kdebug, kinfo, kwarn};

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Inner {
    pub state: PoolState,
    pub queue: VecDeque<Job>,
    /// Threads running a job
    pub active_threads: usize,
    /// Threads waiting for a job
    pub free_threads: usize,
    pub workers: HashMap<WorkerId, JoinHandle<()>>,
    /// Handles of workers that removed themselves, joined later
    pub retired: Vec<JoinHandle<()>>,
    pub next_worker_id: u64,
}

impl Inner {
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.active_threads + self.free_threads
    }
}

pub(crate) struct Shared {
    pub config: ExecutorConfig,
    pub inner: Mutex<Inner>,
    pub work_available: Condvar,
    pub stopped: Condvar,
}

/// Thread pool with low/high watermarks and a bounded queue
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    /// Create an idle pool; no threads exist until [`start`](Self::start)
    pub fn new(config: ExecutorConfig) -> PoolResult<Self> {
        config.validate().map_err(PoolError::InvalidConfig)?;
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: PoolState::Idle,
                    queue: VecDeque::with_capacity(config.max_queue_size),
                    active_threads: 0,
                    free_threads: 0,
                    workers: HashMap::new(),
                    retired: Vec::new(),
                    next_worker_id: 0,
                }),
                work_available: Condvar::new(),
                stopped: Condvar::new(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    /// Idle → Running; brings up `low_watermark` workers
    pub fn start(&self) -> PoolResult<()> {
        let cfg = &self.shared.config;
        let mut inner = self.shared.inner.lock();
        if inner.state != PoolState::Idle {
            return Err(PoolError::AlreadyStarted);
        }
        inner.state = PoolState::Running;

        for _ in 0..cfg.low_watermark {
            if let Err(e) = worker::spawn(&self.shared, &mut inner) {
                inner.state = if inner.thread_count() == 0 {
                    PoolState::Stopped
                } else {
                    PoolState::Stopping
                };
                self.shared.work_available.notify_all();
                return Err(e);
            }
        }

        kinfo!(
            "executor '{}' started: low={} high={} queue={} idle={:?}",
            cfg.name,
            cfg.low_watermark,
            cfg.high_watermark,
            cfg.max_queue_size,
            cfg.idle_timeout
        );
        Ok(())
    }

    /// Queue `f`; rejected when the queue is full or the pool not Running
    pub fn execute<F>(&self, f: F) -> PoolResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Box::new(f))
    }

    /// Queue `f` and get a handle to its return value or panic
    pub fn submit<F, T>(&self, f: F) -> PoolResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (promise, handle) = handle::channel();
        self.push(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())));
            promise.complete(result);
        }))?;
        Ok(handle)
    }

    fn push(&self, job: Job) -> PoolResult<()> {
        let cfg = &self.shared.config;
        let mut inner = self.shared.inner.lock();
        if !inner.state.accepts_work() {
            return Err(PoolError::NotRunning(inner.state));
        }
        if inner.queue.len() >= cfg.max_queue_size {
            return Err(PoolError::QueueFull);
        }
        inner.queue.push_back(job);

        if inner.free_threads == 0 && inner.thread_count() < cfg.high_watermark {
            if let Err(e) = worker::spawn(&self.shared, &mut inner) {
                if inner.thread_count() == 0 {
                    // Nobody would ever run it
                    inner.queue.pop_back();
                    return Err(e);
                }
                kwarn!("executor '{}': could not grow: {}", cfg.name, e);
            }
        }

        self.shared.work_available.notify_one();
        Ok(())
    }

    /// Running → Stopping; queued tasks still run
    ///
    /// With `wait` set, blocks until every worker has exited. Safe to call
    /// repeatedly. Called from one of this pool's own workers it never
    /// waits, since that worker could not exit while blocked here.
    pub fn stop(&self, wait: bool) {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            PoolState::Idle => {
                inner.state = PoolState::Stopped;
                return;
            }
            PoolState::Running => {
                inner.state = if inner.thread_count() == 0 {
                    PoolState::Stopped
                } else {
                    PoolState::Stopping
                };
                kdebug!(
                    "executor '{}' stopping: {} threads, {} queued",
                    self.shared.config.name,
                    inner.thread_count(),
                    inner.queue.len()
                );
                self.shared.work_available.notify_all();
            }
            PoolState::Stopping | PoolState::Stopped => {}
        }

        if !wait {
            return;
        }
        if worker::on_worker_of(&self.shared) {
            kwarn!("executor '{}': stop(wait) from own worker, not waiting", self.shared.config.name);
            return;
        }

        while inner.state != PoolState::Stopped {
            self.shared.stopped.wait(&mut inner);
        }
        let retired = std::mem::take(&mut inner.retired);
        drop(inner);
        for h in retired {
            let _ = h.join();
        }
    }

    pub fn state(&self) -> PoolState {
        self.shared.inner.lock().state
    }

    /// Live worker threads (active + free)
    pub fn thread_count(&self) -> usize {
        self.shared.inner.lock().thread_count()
    }

    pub fn active_threads(&self) -> usize {
        self.shared.inner.lock().active_threads
    }

    pub fn free_threads(&self) -> usize {
        self.shared.inner.lock().free_threads
    }

    /// Tasks queued but not yet picked up
    pub fn queue_len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop(true);
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Executor")
            .field("name", &self.shared.config.name)
            .field("state", &inner.state)
            .field("active", &inner.active_threads)
            .field("free", &inner.free_threads)
            .field("queued", &inner.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn config(low: usize, high: usize, queue: usize) -> ExecutorConfig {
        ExecutorConfig::new()
            .name("test-pool")
            .low_watermark(low)
            .high_watermark(high)
            .max_queue_size(queue)
            .idle_timeout(Duration::from_millis(20))
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Holds jobs until opened
    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        cv: Condvar,
    }

    impl Gate {
        fn wait(&self) {
            let mut open = self.open.lock();
            while !*open {
                self.cv.wait(&mut open);
            }
        }

        fn open(&self) {
            *self.open.lock() = true;
            self.cv.notify_all();
        }
    }

    #[test]
    fn test_small_pool_runs_every_task() {
        let pool = Executor::new(config(1, 3, 2)).unwrap();
        pool.start().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            loop {
                let c = counter.clone();
                match pool.execute(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }) {
                    Ok(()) => break,
                    Err(PoolError::QueueFull) => thread::sleep(Duration::from_millis(1)),
                    Err(e) => panic!("unexpected {e}"),
                }
            }
            assert!(pool.thread_count() <= 3);
        }

        pool.stop(true);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(pool.thread_count(), 0);
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[test]
    fn test_lifecycle_errors() {
        let pool = Executor::new(config(1, 2, 4)).unwrap();
        assert_eq!(pool.execute(|| {}), Err(PoolError::NotRunning(PoolState::Idle)));

        pool.start().unwrap();
        assert_eq!(pool.start(), Err(PoolError::AlreadyStarted));
        assert_eq!(pool.thread_count(), 1);

        pool.stop(true);
        pool.stop(true);
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(pool.execute(|| {}), Err(PoolError::NotRunning(PoolState::Stopped)));
        assert!(pool.submit(|| 1).is_err());
    }

    #[test]
    fn test_stop_idle_pool() {
        let pool = Executor::new(config(2, 2, 4)).unwrap();
        pool.stop(false);
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(pool.start(), Err(PoolError::AlreadyStarted));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            Executor::new(config(3, 2, 4)),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_queue_full_rejects() {
        let pool = Executor::new(config(1, 1, 1)).unwrap();
        pool.start().unwrap();
        let gate = Arc::new(Gate::default());

        let g = gate.clone();
        pool.execute(move || g.wait()).unwrap();
        wait_until("job picked up", || pool.active_threads() == 1);

        pool.execute(|| {}).unwrap();
        assert_eq!(pool.queue_len(), 1);
        assert_eq!(pool.execute(|| {}), Err(PoolError::QueueFull));

        gate.open();
        pool.stop(true);
        assert_eq!(pool.queue_len(), 0);
    }

    #[test]
    fn test_growth_bounded_by_high_watermark() {
        let pool = Executor::new(config(1, 3, 16)).unwrap();
        pool.start().unwrap();
        let gate = Arc::new(Gate::default());
        let ran = Arc::new(AtomicUsize::new(0));

        for n in 1..=10 {
            let (g, r) = (gate.clone(), ran.clone());
            pool.execute(move || {
                g.wait();
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            assert!(pool.thread_count() <= 3);
            if n <= 3 {
                // Growth only happens once no thread is free
                wait_until("job picked up", || pool.active_threads() == n);
            }
        }
        assert_eq!(pool.thread_count(), 3);
        assert_eq!(pool.queue_len(), 7);

        gate.open();
        pool.stop(true);
        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_idle_workers_shrink_to_low_watermark() {
        let pool = Executor::new(config(1, 4, 16)).unwrap();
        pool.start().unwrap();
        let gate = Arc::new(Gate::default());

        for n in 1..=4 {
            let g = gate.clone();
            pool.execute(move || g.wait()).unwrap();
            wait_until("job picked up", || pool.active_threads() == n);
        }
        assert_eq!(pool.thread_count(), 4);

        gate.open();
        wait_until("shrink", || pool.thread_count() == 1);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.thread_count(), 1);
        assert_eq!(pool.state(), PoolState::Running);
    }

    #[test]
    fn test_zero_low_watermark_drains_to_nothing() {
        let pool = Executor::new(config(0, 2, 4)).unwrap();
        pool.start().unwrap();
        assert_eq!(pool.thread_count(), 0);

        let h = pool.submit(|| 5).unwrap();
        assert_eq!(h.join(), Ok(5));
        wait_until("all retired", || pool.thread_count() == 0);

        pool.stop(true);
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[test]
    fn test_panicking_task_keeps_worker() {
        let pool = Executor::new(config(1, 1, 4)).unwrap();
        pool.start().unwrap();

        let bad = pool.submit(|| -> u32 { panic!("bad task") }).unwrap();
        assert_eq!(bad.join(), Err(TaskError::Panicked("bad task".into())));

        pool.execute(|| panic!("plain")).unwrap();
        let good = pool.submit(|| "ok").unwrap();
        assert_eq!(good.join(), Ok("ok"));
        assert_eq!(pool.thread_count(), 1);
    }

    #[test]
    fn test_stop_without_wait_drains_queue() {
        let pool = Executor::new(config(1, 1, 8)).unwrap();
        pool.start().unwrap();
        let gate = Arc::new(Gate::default());
        let ran = Arc::new(AtomicUsize::new(0));

        let g = gate.clone();
        pool.execute(move || g.wait()).unwrap();
        for _ in 0..3 {
            let r = ran.clone();
            pool.execute(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.stop(false);
        assert_eq!(pool.state(), PoolState::Stopping);
        assert!(pool.execute(|| {}).is_err());

        gate.open();
        wait_until("stopped", || pool.state() == PoolState::Stopped);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert_eq!(pool.thread_count(), 0);
    }

    #[test]
    fn test_stop_from_own_worker() {
        let pool = Arc::new(Executor::new(config(1, 1, 4)).unwrap());
        pool.start().unwrap();

        let p = pool.clone();
        let h = pool.submit(move || p.stop(true)).unwrap();
        assert_eq!(h.join(), Ok(()));

        pool.stop(true);
        assert_eq!(pool.state(), PoolState::Stopped);
    }
}
