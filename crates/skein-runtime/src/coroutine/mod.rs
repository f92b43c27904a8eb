//! Cooperative coroutine engine
//!
//! Multiplexes many tasks onto the thread that owns the [`Engine`]. Every
//! task runs on its own mmap'd stack; a switch only exchanges callee-saved
//! registers, so no stack bytes are ever copied.
//!
//! Control always passes through the root context (the thread's own stack
//! inside [`Engine::start`], [`Engine::yield_now`] or [`Engine::resume`]):
//!
//! ```text
//!   root ──switch──> task A ──yield──> root ──switch──> task B ...
//! ```
//!
//! A task leaves the CPU in one of four ways, and the root decides what
//! happens next from the state it left behind:
//!
//! - `yield_now()` - state Runnable, appended to the alive ring
//! - `block_current()` - state Blocked, out of the ring until `wake`/`resume`
//! - `resume(id)` - state Runnable, and `id` runs next
//! - body returns - state Finished, slot and stack released
//!
//! The engine is `!Send`; every operation happens on its owning thread.
//! Tasks still suspended when the engine is dropped have their stacks
//! unmapped without unwinding, so values living on those stacks leak.

mod context;
mod registry;

pub use context::SavedContext;

use crate::config::EngineConfig;
use crate::current_arch::{self, SavedRegs};
use crate::panic_message;
use registry::{Registry, Task};

use skein_core::error::{SchedError, SchedResult};
use skein_core::id::TaskId;
use skein_core::state::TaskState;
use skein_core::{kdebug, kerror, ktrace, kwarn};

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

thread_local! {
    /// Engine driving tasks on this thread, null when none
    static CURRENT_ENGINE: Cell<*const EngineInner> = const { Cell::new(ptr::null()) };
}

struct EngineInner {
    config: EngineConfig,
    registry: UnsafeCell<Registry>,
    /// Where tasks switch back to
    root: UnsafeCell<SavedRegs>,
    /// Task on the CPU; None while the root runs
    current: Cell<Option<TaskId>>,
    /// Task that asked `resume` to run next
    handoff: Cell<Option<TaskId>>,
    driving: Cell<bool>,
}

/// Restores the thread-local engine pointer when the root stops driving
struct DriveGuard<'a> {
    inner: &'a EngineInner,
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        self.inner.driving.set(false);
        CURRENT_ENGINE.with(|c| c.set(ptr::null()));
    }
}

impl EngineInner {
    /// Borrow the registry
    ///
    /// Single-threaded; no caller keeps the borrow across a context switch
    /// or across a call that borrows again.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    fn registry(&self) -> &mut Registry {
        unsafe { &mut *self.registry.get() }
    }

    fn enter(&self) -> SchedResult<DriveGuard<'_>> {
        if self.driving.get() || CURRENT_ENGINE.with(|c| !c.get().is_null()) {
            return Err(SchedError::AlreadyRunning);
        }
        self.driving.set(true);
        CURRENT_ENGINE.with(|c| c.set(self as *const EngineInner));
        Ok(DriveGuard { inner: self })
    }

    fn spawn_task(&self, entry: Box<dyn FnOnce()>) -> SchedResult<TaskId> {
        let arg = self as *const EngineInner as usize;
        let stack_size = self.config.stack_size;
        let id = self.registry().insert_with(|id| {
            Ok(Task {
                id,
                state: TaskState::Spawned,
                context: SavedContext::new(stack_size, task_entry, arg)?,
                entry: Some(entry),
                notified: false,
            })
        })?;
        ktrace!("spawned task {}", id);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Root side
    // ------------------------------------------------------------------

    /// Switch into `id` and settle its state once it switches back
    fn run_task(&self, id: TaskId) {
        let to = match self.registry().get_mut(id) {
            Some(task) => {
                task.state = TaskState::Running;
                task.context.regs_ptr()
            }
            None => return,
        };

        self.current.set(Some(id));
        // SAFETY: `to` points into a live task's boxed registers; the task
        // switches back to `root` before it can be removed.
        unsafe { current_arch::switch_context(self.root.get(), to) };
        self.current.set(None);

        let reg = self.registry();
        match reg.get(id).map(|t| t.state) {
            Some(TaskState::Finished) => {
                reg.remove(id);
                ktrace!("task {} finished", id);
            }
            Some(TaskState::Blocked) | None => {}
            Some(_) => {
                if let Some(task) = reg.get_mut(id) {
                    task.state = TaskState::Runnable;
                }
                reg.push_runnable(id);
            }
        }
    }

    /// Run pending `resume` targets until control comes back with none
    fn run_handoffs(&self) {
        while let Some(next) = self.handoff.take() {
            self.run_task(next);
        }
    }

    /// Run until nothing is runnable
    fn drain(&self) {
        loop {
            let next = match self.handoff.take() {
                Some(id) => Some(id),
                None => self.registry().pop_runnable(),
            };
            match next {
                Some(id) => self.run_task(id),
                None => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // Task side
    // ------------------------------------------------------------------

    fn switch_to_root(&self, me: TaskId) {
        let from = match self.registry().get_mut(me) {
            Some(task) => task.context.regs_ptr(),
            None => return,
        };
        // SAFETY: the root context is saved every time it switches to a
        // task, and the root stack outlives every task.
        unsafe { current_arch::switch_context(from, self.root.get()) };
    }

    fn yield_current(&self, me: TaskId) {
        if self.registry().runnable() == 0 {
            return;
        }
        if let Some(task) = self.registry().get_mut(me) {
            task.state = TaskState::Runnable;
        }
        self.switch_to_root(me);
    }

    fn block_current(&self, me: TaskId) {
        match self.registry().get_mut(me) {
            Some(task) if task.notified => {
                task.notified = false;
                return;
            }
            Some(task) => task.state = TaskState::Blocked,
            None => return,
        }
        self.switch_to_root(me);
    }

    fn resume_from(&self, me: TaskId, target: TaskId) -> SchedResult<()> {
        if target == me {
            return Ok(());
        }
        self.check_live(target)?;
        self.registry().unlink(target);
        self.handoff.set(Some(target));
        if let Some(task) = self.registry().get_mut(me) {
            task.state = TaskState::Runnable;
        }
        self.switch_to_root(me);
        Ok(())
    }

    /// Entry point of every task's stack, never returns
    fn finish_current(&self) -> ! {
        if let Some(me) = self.current.get() {
            if let Some(task) = self.registry().get_mut(me) {
                task.state = TaskState::Finished;
            }
            self.switch_to_root(me);
        }
        // The root never switches back into a finished task
        kerror!("finished task resumed");
        std::process::abort()
    }

    // ------------------------------------------------------------------
    // Either side
    // ------------------------------------------------------------------

    fn check_live(&self, id: TaskId) -> SchedResult<TaskState> {
        match self.registry().get(id).map(|t| t.state) {
            Some(TaskState::Finished) | None => Err(SchedError::TaskNotFound(id)),
            Some(state) => Ok(state),
        }
    }

    fn wake(&self, id: TaskId) -> SchedResult<()> {
        let reg = self.registry();
        let task = reg.get_mut(id).ok_or(SchedError::TaskNotFound(id))?;
        match task.state {
            TaskState::Blocked => {
                task.state = TaskState::Runnable;
                reg.push_runnable(id);
            }
            TaskState::Finished => return Err(SchedError::TaskNotFound(id)),
            _ => task.notified = true,
        }
        Ok(())
    }
}

extern "C" fn task_entry(arg: usize) -> ! {
    // SAFETY: `arg` is the boxed EngineInner that spawned this task; it
    // outlives every task it owns.
    let inner = unsafe { &*(arg as *const EngineInner) };
    run_body(inner);
    inner.finish_current()
}

/// Run the task body; every local is dropped before the final switch
#[inline(never)]
fn run_body(inner: &EngineInner) {
    let Some(me) = inner.current.get() else {
        return;
    };
    let entry = inner.registry().get_mut(me).and_then(|t| t.entry.take());
    if let Some(f) = entry {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            kerror!("task {} panicked: {}", me, panic_message(payload.as_ref()));
        }
    }
}

/// Cooperative scheduler bound to one thread
pub struct Engine {
    inner: Box<EngineInner>,
    _not_send: PhantomData<*const ()>,
}

impl Engine {
    /// Create an engine with no tasks
    pub fn new(config: EngineConfig) -> SchedResult<Self> {
        config.validate().map_err(SchedError::InvalidConfig)?;
        kdebug!(
            "engine created: stack_size={} max_tasks={}",
            config.stack_size,
            config.max_tasks
        );
        Ok(Self {
            inner: Box::new(EngineInner {
                registry: UnsafeCell::new(Registry::new(config.max_tasks)),
                root: UnsafeCell::new(SavedRegs::default()),
                current: Cell::new(None),
                handoff: Cell::new(None),
                driving: Cell::new(false),
                config,
            }),
            _not_send: PhantomData,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Add a task to the back of the alive ring without running it
    pub fn spawn<F>(&self, f: F) -> SchedResult<TaskId>
    where
        F: FnOnce() + 'static,
    {
        self.inner.spawn_task(Box::new(f))
    }

    /// Spawn `main` and drive every task until none is runnable
    ///
    /// Returns how many tasks are left blocked. Nonzero means nobody is
    /// ever going to wake them.
    pub fn start<F>(&self, main: F) -> SchedResult<usize>
    where
        F: FnOnce() + 'static,
    {
        let _guard = self.inner.enter()?;
        self.inner.spawn_task(Box::new(main))?;
        self.inner.drain();

        let blocked = self.inner.registry().blocked();
        if blocked > 0 {
            kwarn!("engine idle with {} blocked tasks", blocked);
        }
        Ok(blocked)
    }

    /// Run the next runnable task until control returns to this thread
    ///
    /// Returns false when nothing was runnable.
    pub fn yield_now(&self) -> SchedResult<bool> {
        let _guard = self.inner.enter()?;
        let Some(id) = self.inner.registry().pop_runnable() else {
            return Ok(false);
        };
        self.inner.run_task(id);
        self.inner.run_handoffs();
        Ok(true)
    }

    /// Run a specific runnable or blocked task until control returns
    pub fn resume(&self, id: TaskId) -> SchedResult<()> {
        let _guard = self.inner.enter()?;
        self.inner.check_live(id)?;
        self.inner.registry().unlink(id);
        self.inner.run_task(id);
        self.inner.run_handoffs();
        Ok(())
    }

    /// Make a blocked task runnable, or leave a wake permit for a running one
    pub fn wake(&self, id: TaskId) -> SchedResult<()> {
        self.inner.wake(id)
    }

    /// Current state of a task, None once it finished
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.inner.registry().get(id).map(|t| t.state)
    }

    /// Live tasks (any state but Finished)
    pub fn task_count(&self) -> usize {
        self.inner.registry().live()
    }

    /// Tasks in the alive ring
    pub fn runnable_count(&self) -> usize {
        self.inner.registry().runnable()
    }

    pub fn blocked_count(&self) -> usize {
        self.inner.registry().blocked()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.inner.driving.get() {
            // A task dropped its own engine; its stack is about to vanish
            kerror!("engine dropped while driving tasks");
            std::process::abort();
        }
        let discarded = self.inner.registry().clear();
        if discarded > 0 {
            kdebug!("engine dropped with {} unfinished tasks", discarded);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("tasks", &self.task_count())
            .field("runnable", &self.runnable_count())
            .finish()
    }
}

// ============================================================================
// Task-side API
// ============================================================================

fn with_engine<R>(f: impl FnOnce(&EngineInner) -> SchedResult<R>) -> SchedResult<R> {
    let ptr = CURRENT_ENGINE.with(|c| c.get());
    if ptr.is_null() {
        return Err(SchedError::NotInTask);
    }
    // SAFETY: the pointer is set only while the engine drives on this thread
    f(unsafe { &*ptr })
}

fn with_task<R>(f: impl FnOnce(&EngineInner, TaskId) -> SchedResult<R>) -> SchedResult<R> {
    with_engine(|inner| match inner.current.get() {
        Some(me) => f(inner, me),
        None => Err(SchedError::NotInTask),
    })
}

/// Let the next runnable task run
///
/// Returns immediately when nothing else is runnable or when called
/// outside any task.
pub fn yield_now() {
    let _ = with_task(|inner, me| {
        inner.yield_current(me);
        Ok(())
    });
}

/// Switch straight to `id`; the caller goes to the back of the ring
pub fn resume(id: TaskId) -> SchedResult<()> {
    with_task(|inner, me| inner.resume_from(me, id))
}

/// Suspend the calling task until someone calls [`wake`] or [`resume`]
///
/// Consumes a pending wake permit instead of suspending.
pub fn block_current() -> SchedResult<()> {
    with_task(|inner, me| {
        inner.block_current(me);
        Ok(())
    })
}

/// Make a blocked task runnable
///
/// Waking a task that is not blocked leaves a permit, so its next
/// `block_current` returns at once.
pub fn wake(id: TaskId) -> SchedResult<()> {
    with_engine(|inner| inner.wake(id))
}

/// Spawn a sibling task on the engine running the caller
pub fn spawn<F>(f: F) -> SchedResult<TaskId>
where
    F: FnOnce() + 'static,
{
    with_engine(|inner| inner.spawn_task(Box::new(f)))
}

/// Id of the calling task
pub fn current() -> Option<TaskId> {
    with_engine(|inner| Ok(inner.current.get())).ok().flatten()
}

/// Other tasks waiting in the alive ring
pub fn runnable_count() -> usize {
    with_engine(|inner| Ok(inner.registry().runnable())).unwrap_or(0)
}
