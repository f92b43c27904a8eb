//! epoll poller and eventfd notifier
//!
//! `Poller` is a thin epoll wrapper: sockets are registered with a caller
//! chosen `u64` token and come back as [`Readiness`] records. `Notifier`
//! wakes a thread blocked in `Poller::wait` from any other thread.

use crate::interest::Interest;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[inline]
fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 { Err(io::Error::last_os_error()) } else { Ok(ret) }
}

/// Readiness reported for one token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    /// Peer closed (fully or its write half)
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    fn from_epoll(token: u64, bits: u32) -> Self {
        let has = |flag: libc::c_int| bits & flag as u32 != 0;
        Self {
            token,
            readable: has(libc::EPOLLIN) || has(libc::EPOLLPRI),
            writable: has(libc::EPOLLOUT),
            hangup: has(libc::EPOLLHUP) || has(libc::EPOLLRDHUP),
            error: has(libc::EPOLLERR),
        }
    }
}

/// Event buffer filled by [`Poller::wait`]
pub struct Events {
    buf: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap.max(1)) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Readiness> + '_ {
        // Fields are copied out; epoll_event is packed on x86_64
        self.buf.iter().map(|ev| {
            let token = ev.u64;
            let bits = ev.events;
            Readiness::from_epoll(token, bits)
        })
    }
}

/// Owned epoll instance
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, bits: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: bits, u64: token };
        cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) })?;
        Ok(())
    }

    fn mask(interest: Interest, oneshot: bool) -> u32 {
        let mut bits = interest.to_epoll();
        if oneshot {
            bits |= libc::EPOLLONESHOT as u32;
        }
        bits
    }

    /// Register `fd` under `token`
    ///
    /// A oneshot registration is disabled after its first event until
    /// re-armed with [`modify`](Self::modify).
    pub fn add(&self, fd: RawFd, token: u64, interest: Interest, oneshot: bool) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, Self::mask(interest, oneshot))
    }

    pub fn modify(&self, fd: RawFd, token: u64, interest: Interest, oneshot: bool) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, Self::mask(interest, oneshot))
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Wait for readiness; `None` blocks indefinitely
    ///
    /// An interrupted wait returns zero events.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) if d.is_zero() => 0,
            // Round up so a sub-millisecond timeout still sleeps
            Some(d) => d.as_millis().clamp(1, i32::MAX as u128) as libc::c_int,
        };

        events.buf.clear();
        let cap = events.buf.capacity().min(i32::MAX as usize) as libc::c_int;
        let n = unsafe { libc::epoll_wait(self.epfd, events.buf.as_mut_ptr(), cap, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        // SAFETY: the kernel initialized the first n entries
        unsafe { events.buf.set_len(n as usize) };
        Ok(n as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

/// Cross-thread wakeup over an eventfd
///
/// Several `notify` calls before the reader drains coalesce into one
/// wakeup (eventfd counter semantics).
pub struct Notifier {
    fd: RawFd,
}

impl Notifier {
    pub fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        Ok(Self { fd })
    }

    /// Descriptor to register with a [`Poller`]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Never blocks
    pub fn notify(&self) -> io::Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: a wakeup is already pending
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Reset the counter; returns how many notifications were pending
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 { 0 } else { val }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
