//! Task registry
//!
//! Slab of task slots plus the alive ring. The ring holds only tasks that
//! are runnable and not current; the running task and blocked tasks live
//! in their slots but outside the ring.

use super::context::SavedContext;
use skein_core::error::{SchedError, SchedResult};
use skein_core::id::TaskId;
use skein_core::state::TaskState;
use std::collections::VecDeque;

/// One logical thread of control
pub(crate) struct Task {
    pub id: TaskId,
    pub state: TaskState,
    pub context: SavedContext,
    /// Body, taken on first run
    pub entry: Option<Box<dyn FnOnce()>>,
    /// Wake permit: a `wake` that arrived while not blocked
    pub notified: bool,
}

struct Slot {
    generation: u32,
    task: Option<Task>,
}

pub(crate) struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    alive: VecDeque<TaskId>,
    live: usize,
    max_tasks: usize,
}

impl Registry {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            alive: VecDeque::new(),
            live: 0,
            max_tasks,
        }
    }

    /// Reserve a slot, build the task for its id and link it at the back
    /// of the ring. On failure the slot is returned untouched.
    pub fn insert_with<F>(&mut self, build: F) -> SchedResult<TaskId>
    where
        F: FnOnce(TaskId) -> SchedResult<Task>,
    {
        if self.live >= self.max_tasks {
            return Err(SchedError::NoSlotsAvailable);
        }
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot { generation: 0, task: None });
                (self.slots.len() - 1) as u32
            }
        };
        let id = TaskId::new(index, self.slots[index as usize].generation);
        match build(id) {
            Ok(task) => {
                self.slots[index as usize].task = Some(task);
                self.live += 1;
                self.alive.push_back(id);
                Ok(id)
            }
            Err(e) => {
                self.free.push(index);
                Err(e)
            }
        }
    }

    #[inline]
    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.slots
            .get(id.index())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.task.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.task.as_mut())
    }

    /// Drop a task and recycle its slot; stale ids stop matching
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation())?;
        let task = slot.task.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        self.live -= 1;
        self.unlink(id);
        Some(task)
    }

    /// Next runnable task in round-robin order
    pub fn pop_runnable(&mut self) -> Option<TaskId> {
        while let Some(id) = self.alive.pop_front() {
            if self.get(id).is_some_and(|t| t.state.is_runnable()) {
                return Some(id);
            }
        }
        None
    }

    pub fn push_runnable(&mut self, id: TaskId) {
        self.alive.push_back(id);
    }

    /// Take a task out of the ring without touching its slot
    pub fn unlink(&mut self, id: TaskId) {
        if let Some(pos) = self.alive.iter().position(|&x| x == id) {
            self.alive.remove(pos);
        }
    }

    /// Runnable tasks waiting in the ring
    #[inline]
    pub fn runnable(&self) -> usize {
        self.alive.len()
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn blocked(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.task.as_ref())
            .filter(|t| t.state == TaskState::Blocked)
            .count()
    }

    /// Empty every slot; returns how many tasks were discarded
    pub fn clear(&mut self) -> usize {
        let n = self.live;
        self.alive.clear();
        self.free.clear();
        self.slots.clear();
        self.live = 0;
        n
    }
}
