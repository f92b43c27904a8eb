//! Coroutine stack memory
//!
//! Every task owns one [`Stack`]: an anonymous mapping with a guard page
//! at its low end, so an overflow faults instead of scribbling over a
//! neighbour. Platform-specific code does the mapping.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::page_size;
    } else {
        compile_error!("skein coroutine stacks require a unix platform");
    }
}

use skein_core::constants::GUARD_SIZE;

/// One task's private stack
///
/// Layout (addresses grow to the right, the stack grows left):
///
/// ```text
/// base           base+GUARD                         base+len
///  | guard (none) |        usable stack               | <- top
/// ```
pub struct Stack {
    /// Start of the mapping (guard page)
    base: *mut u8,

    /// Mapping length including the guard
    len: usize,
}

impl Stack {
    /// High end of the stack; initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    /// Lowest usable address (just above the guard)
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(GUARD_SIZE) }
    }

    /// Usable bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.len - GUARD_SIZE
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("size", &self.size())
            .finish()
    }
}
