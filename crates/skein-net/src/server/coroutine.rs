//! Coroutine strategy
//!
//! Everything runs on the calling thread inside one [`Engine`]. The first
//! task owns epoll: it accepts, spawns one task per connection, and wakes
//! the task whose socket became ready. A connection task drives its state
//! machine, re-arms its oneshot registration and blocks again.
//!
//! The io task only sleeps in epoll when no other task is runnable;
//! otherwise it polls without a timeout and yields.

use super::{accept_ready, dispatch, Server, ServerError, EVENTS_PER_WAIT, FIRST_CONN_TOKEN,
    LISTENER_TOKEN, NOTIFY_TOKEN};
use crate::connection::Connection;
use crate::interest::Interest;
use crate::poller::{Events, Poller, Readiness};
use crate::text_protocol::TextParser;

use skein_core::{kdebug, kerror, kinfo, ktrace, TaskId};
use skein_runtime::coroutine::{self, Engine};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

/// Where the io task leaves a readiness report for a blocked connection
type Mailbox = Rc<Cell<Option<Readiness>>>;

struct Waiter {
    task: TaskId,
    mailbox: Mailbox,
}

struct Loop {
    server: Server,
    poller: Poller,
    waiters: RefCell<HashMap<u64, Waiter>>,
    live: Cell<usize>,
    next_token: Cell<u64>,
    /// Set once the io task is leaving; connection tasks exit on wakeup
    stopping: Cell<bool>,
    failure: RefCell<Option<io::Error>>,
}

pub(super) fn run(server: Server) -> Result<(), ServerError> {
    let engine = Engine::new(server.config.engine.clone())?;
    let poller = Poller::new()?;
    poller.add(server.listener.as_raw_fd(), LISTENER_TOKEN, Interest::Read, false)?;
    poller.add(server.shutdown.notifier.fd(), NOTIFY_TOKEN, Interest::Read, false)?;

    let lp = Rc::new(Loop {
        server,
        poller,
        waiters: RefCell::new(HashMap::new()),
        live: Cell::new(0),
        next_token: Cell::new(FIRST_CONN_TOKEN),
        stopping: Cell::new(false),
        failure: RefCell::new(None),
    });

    let io = lp.clone();
    let blocked = engine.start(move || io_task(io))?;
    kinfo!("coroutine server stopped, {} tasks left blocked", blocked);

    let failure = lp.failure.borrow_mut().take();
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn io_task(lp: Rc<Loop>) {
    let mut events = Events::with_capacity(EVENTS_PER_WAIT);

    while !lp.server.shutdown.is_triggered() {
        let timeout = if coroutine::runnable_count() > 0 {
            Some(Duration::ZERO)
        } else {
            None
        };
        if let Err(e) = lp.poller.wait(&mut events, timeout) {
            kerror!("epoll wait failed: {}", e);
            *lp.failure.borrow_mut() = Some(e);
            break;
        }

        for ready in events.iter() {
            match ready.token {
                LISTENER_TOKEN => accept(&lp),
                NOTIFY_TOKEN => {
                    lp.server.shutdown.notifier.drain();
                }
                token => deliver(&lp, token, Some(ready)),
            }
        }
        coroutine::yield_now();
    }

    // Every connection task wakes to an empty mailbox and exits
    lp.stopping.set(true);
    let tokens: Vec<u64> = lp.waiters.borrow().keys().copied().collect();
    for token in tokens {
        deliver(&lp, token, None);
    }
}

fn deliver(lp: &Loop, token: u64, ready: Option<Readiness>) {
    let waiters = lp.waiters.borrow();
    let Some(waiter) = waiters.get(&token) else {
        return;
    };
    waiter.mailbox.set(ready);
    if let Err(e) = coroutine::wake(waiter.task) {
        kdebug!("wake token {} failed: {}", token, e);
    }
}

fn accept(lp: &Rc<Loop>) {
    accept_ready(
        &lp.server.listener,
        &lp.server.config,
        lp.live.get(),
        |stream, peer| {
            let token = lp.next_token.get();
            let owner = lp.clone();
            match coroutine::spawn(move || connection_task(owner, token, stream)) {
                Ok(_) => {
                    lp.next_token.set(token + 1);
                    lp.live.set(lp.live.get() + 1);
                    ktrace!("accepted {} as token {}", peer, token);
                    true
                }
                Err(e) => {
                    kdebug!("no task for {}: {}", peer, e);
                    false
                }
            }
        },
    );
}

/// A connection task's footprint in the loop, released however the task ends
struct Registration<'a> {
    lp: &'a Loop,
    token: u64,
    fd: RawFd,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.lp.waiters.borrow_mut().remove(&self.token);
        let _ = self.lp.poller.delete(self.fd);
        self.lp.live.set(self.lp.live.get() - 1);
        ktrace!("token {} closed", self.token);
    }
}

fn connection_task(lp: Rc<Loop>, token: u64, stream: TcpStream) {
    let fd = stream.as_raw_fd();
    let Some(task) = coroutine::current() else {
        lp.live.set(lp.live.get() - 1);
        return;
    };

    let mut conn = Connection::new(stream, Box::new(TextParser::new()), lp.server.storage.clone());
    let mailbox: Mailbox = Rc::new(Cell::new(None));
    lp.waiters.borrow_mut().insert(token, Waiter { task, mailbox: mailbox.clone() });
    // Declared after `conn`: dropped first, so the slot is free before the socket closes
    let _registration = Registration { lp: &lp, token, fd };

    let mut armed = lp.poller.add(fd, token, Interest::Read, true);
    while armed.is_ok() && !lp.stopping.get() {
        if coroutine::block_current().is_err() {
            break;
        }
        let Some(ready) = mailbox.take() else {
            continue;
        };

        dispatch(&mut conn, ready);
        if !conn.is_alive() {
            break;
        }
        armed = lp.poller.modify(fd, token, conn.interest(), true);
    }
    if let Err(e) = armed {
        kdebug!("token {} registration failed: {}", token, e);
    }
}
