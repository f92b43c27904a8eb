//! Task and pool lifecycle states

use core::fmt;

/// State of a coroutine task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Context built, never selected
    Spawned = 0,

    /// In the alive ring, waiting for its turn
    Runnable = 1,

    /// Owns the CPU right now
    Running = 2,

    /// Out of the alive ring until someone calls `wake`/`resume`
    Blocked = 3,

    /// Entry function returned; slot released
    Finished = 4,
}

impl TaskState {
    /// Check if the scheduler may pick this task
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, TaskState::Spawned | TaskState::Runnable)
    }

    /// Check if this task has terminated
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, TaskState::Finished)
    }
}

/// Lifecycle of an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    /// Created, no workers yet
    Idle = 0,

    /// Fully operational, tasks can be added and get executed
    Running = 1,

    /// No new tasks accepted; queued ones still run to completion
    Stopping = 2,

    /// Every worker has exited
    Stopped = 3,
}

impl PoolState {
    #[inline]
    pub const fn accepts_work(&self) -> bool {
        matches!(self, PoolState::Running)
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolState::Idle => write!(f, "IDLE"),
            PoolState::Running => write!(f, "RUNNING"),
            PoolState::Stopping => write!(f, "STOPPING"),
            PoolState::Stopped => write!(f, "STOPPED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_predicates() {
        assert!(TaskState::Spawned.is_runnable());
        assert!(TaskState::Runnable.is_runnable());
        assert!(!TaskState::Running.is_runnable());
        assert!(!TaskState::Blocked.is_runnable());

        assert!(TaskState::Finished.is_terminated());
        assert!(!TaskState::Blocked.is_terminated());
    }

    #[test]
    fn test_only_running_pool_accepts_work() {
        assert!(PoolState::Running.accepts_work());
        assert!(!PoolState::Idle.accepts_work());
        assert!(!PoolState::Stopping.accepts_work());
        assert!(!PoolState::Stopped.accepts_work());
    }
}
