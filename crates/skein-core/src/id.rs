//! Task and worker identifier types

use core::fmt;

/// Identifier for a coroutine task
///
/// `index` addresses the engine's slot table, `generation` is bumped every
/// time a slot is reused so a stale id never resumes a different task.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    index: u32,
    generation: u32,
}

impl TaskId {
    /// Create a new TaskId from its parts
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        TaskId { index, generation }
    }

    /// Slot index
    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    /// Slot generation
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}#{})", self.index, self.generation)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Stable handle for an executor worker thread
///
/// Handed out once at spawn time and never reused within a pool.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    #[inline]
    pub const fn new(id: u64) -> Self {
        WorkerId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_parts() {
        let id = TaskId::new(7, 3);
        assert_eq!(id.index(), 7);
        assert_eq!(id.generation(), 3);
        assert_eq!(format!("{:?}", id), "TaskId(7#3)");
    }

    #[test]
    fn test_generation_distinguishes_reuse() {
        assert_ne!(TaskId::new(1, 0), TaskId::new(1, 1));
    }
}
