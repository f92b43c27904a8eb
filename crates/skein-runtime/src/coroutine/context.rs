//! Saved execution context of one task

use crate::current_arch::{self, SavedRegs};
use crate::memory::Stack;
use skein_core::error::MemoryError;

/// Register file plus the private stack it points into
///
/// The register block is boxed so its address survives the owning task
/// moving around inside the registry; `switch_context` writes through a
/// raw pointer to it.
pub struct SavedContext {
    regs: Box<SavedRegs>,
    stack: Stack,
}

impl SavedContext {
    /// Map a fresh stack and prepare it so the first switch runs
    /// `entry(arg)` on it
    pub fn new(
        stack_size: usize,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
    ) -> Result<Self, MemoryError> {
        let stack = Stack::new(stack_size)?;
        let mut regs = Box::<SavedRegs>::default();
        // SAFETY: the stack is owned by this context and outlives every
        // switch into it.
        unsafe { current_arch::init_context(&mut regs, stack.top(), entry, arg) };
        Ok(Self { regs, stack })
    }

    #[inline]
    pub fn regs_ptr(&mut self) -> *mut SavedRegs {
        &mut *self.regs
    }
}

impl std::fmt::Debug for SavedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedContext")
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}
