//! Unix stack implementation using mmap

use super::Stack;
use skein_core::constants::GUARD_SIZE;
use skein_core::error::MemoryError;
use std::sync::OnceLock;

/// System page size, cached
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 { sz as usize } else { 4096 }
    })
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        const MAP_FLAGS: libc::c_int =
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK;
    } else {
        const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;
    }
}

impl Stack {
    /// Map a stack with at least `size` usable bytes
    ///
    /// Pages are committed lazily by the kernel; only touched memory
    /// costs physical pages.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        let page = page_size();
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let usable = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or(MemoryError::InvalidSize(size))?;
        let len = usable
            .checked_add(GUARD_SIZE)
            .ok_or(MemoryError::InvalidSize(size))?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed(errno()));
        }

        // Guard page stays PROT_NONE: overflow raises SIGSEGV
        let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            let err = errno();
            unsafe { libc::munmap(base, len) };
            return Err(MemoryError::ProtectionFailed(err));
        }

        Ok(Stack { base: base as *mut u8, len })
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_rounds_to_pages() {
        let stack = Stack::new(10_000).unwrap();
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() >= 10_000);
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.size());
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(64 * 1024).unwrap();
        unsafe {
            let last = stack.top().sub(1);
            *last = 0xAB;
            *stack.bottom() = 0xCD;
            assert_eq!(*last, 0xAB);
            assert_eq!(*stack.bottom(), 0xCD);
        }
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.size());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(Stack::new(0), Err(MemoryError::InvalidSize(0))));
    }
}
