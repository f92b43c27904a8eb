//! Readiness interest of a connection

/// Which readiness events a connection wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
}

impl Interest {
    #[inline]
    pub const fn is_readable(self) -> bool {
        matches!(self, Interest::Read | Interest::ReadWrite)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        matches!(self, Interest::Write | Interest::ReadWrite)
    }

    /// epoll event mask; read interest includes peer half-close
    pub const fn to_epoll(self) -> u32 {
        let mut bits = 0u32;
        if self.is_readable() {
            bits |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if self.is_writable() {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }
}
