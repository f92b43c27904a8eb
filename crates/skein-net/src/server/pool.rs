//! Thread-pool strategy
//!
//! The calling thread is the reactor: it owns epoll, accepts sockets and
//! turns readiness into executor jobs. Connections are registered
//! oneshot, so a connection is never handed to two workers at once. A
//! worker finishing with a connection queues a re-arm (or close) request
//! and pokes the reactor through the notifier; only the reactor touches
//! epoll registrations.

use super::{accept_ready, dispatch, Server, ServerError, EVENTS_PER_WAIT, FIRST_CONN_TOKEN,
    LISTENER_TOKEN, NOTIFY_TOKEN};
use crate::connection::Connection;
use crate::interest::Interest;
use crate::poller::{Events, Notifier, Poller, Readiness};
use crate::text_protocol::TextParser;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use skein_core::{kdebug, kinfo, ktrace, kwarn};
use skein_runtime::Executor;

use std::collections::HashMap;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

type SharedConn = Arc<Mutex<Connection<TcpStream>>>;

/// Worker to reactor
enum Request {
    Rearm(u64, Interest),
    Close(u64),
}

struct Entry {
    fd: RawFd,
    conn: SharedConn,
}

/// One readiness report bound for a worker
#[derive(Clone)]
struct Job {
    token: u64,
    ready: Readiness,
    conn: SharedConn,
    requests: Arc<SegQueue<Request>>,
    notifier: Arc<Notifier>,
}

impl Job {
    fn run(self) {
        // A panicking handler costs the connection, never the registration
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut conn = self.conn.lock();
            dispatch(&mut *conn, self.ready);
            if conn.is_alive() {
                Request::Rearm(self.token, conn.interest())
            } else {
                Request::Close(self.token)
            }
        }));
        let request = outcome.unwrap_or_else(|_| {
            kwarn!("handler for token {} panicked, closing", self.token);
            Request::Close(self.token)
        });
        self.requests.push(request);
        let _ = self.notifier.notify();
    }
}

struct Reactor {
    server: Server,
    poller: Poller,
    executor: Executor,
    conns: HashMap<u64, Entry>,
    requests: Arc<SegQueue<Request>>,
    next_token: u64,
}

pub(super) fn run(server: Server) -> Result<(), ServerError> {
    let executor = Executor::new(server.config.executor.clone())?;
    let poller = Poller::new()?;
    poller.add(server.listener.as_raw_fd(), LISTENER_TOKEN, Interest::Read, false)?;
    poller.add(server.shutdown.notifier.fd(), NOTIFY_TOKEN, Interest::Read, false)?;
    executor.start()?;

    let mut reactor = Reactor {
        server,
        poller,
        executor,
        conns: HashMap::new(),
        requests: Arc::new(SegQueue::new()),
        next_token: FIRST_CONN_TOKEN,
    };
    let result = reactor.serve();
    reactor.finish();
    result
}

impl Reactor {
    fn serve(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(EVENTS_PER_WAIT);

        while !self.server.shutdown.is_triggered() {
            self.poller.wait(&mut events, None)?;

            for ready in events.iter() {
                match ready.token {
                    LISTENER_TOKEN => self.accept(),
                    NOTIFY_TOKEN => {
                        self.server.shutdown.notifier.drain();
                    }
                    token => self.submit(token, ready),
                }
            }
            self.apply_requests();
        }
        Ok(())
    }

    fn accept(&mut self) {
        let Self { server, poller, conns, next_token, .. } = self;
        let storage = &server.storage;

        accept_ready(
            &server.listener,
            &server.config,
            conns.len(),
            |stream, peer| {
                let token = *next_token;
                let fd = stream.as_raw_fd();
                if let Err(e) = poller.add(fd, token, Interest::Read, true) {
                    kdebug!("register {} failed: {}", peer, e);
                    return false;
                }
                *next_token += 1;
                ktrace!("accepted {} as token {}", peer, token);
                let conn = Connection::new(stream, Box::new(TextParser::new()), storage.clone());
                conns.insert(token, Entry { fd, conn: Arc::new(Mutex::new(conn)) });
                true
            },
        );
    }

    fn submit(&mut self, token: u64, ready: Readiness) {
        let Some(entry) = self.conns.get(&token) else {
            return;
        };
        let job = Job {
            token,
            ready,
            conn: entry.conn.clone(),
            requests: self.requests.clone(),
            notifier: self.server.shutdown.notifier.clone(),
        };
        let fallback = job.clone();
        if let Err(e) = self.executor.execute(move || job.run()) {
            // Backpressure: serve it here rather than drop readiness
            ktrace!("executor rejected token {} ({}), running inline", token, e);
            fallback.run();
        }
    }

    fn apply_requests(&mut self) {
        while let Some(request) = self.requests.pop() {
            match request {
                Request::Rearm(token, interest) => {
                    let Some(entry) = self.conns.get(&token) else {
                        continue;
                    };
                    if let Err(e) = self.poller.modify(entry.fd, token, interest, true) {
                        kdebug!("re-arm token {} failed: {}", token, e);
                        self.close(token);
                    }
                }
                Request::Close(token) => self.close(token),
            }
        }
    }

    fn close(&mut self, token: u64) {
        if let Some(entry) = self.conns.remove(&token) {
            let _ = self.poller.delete(entry.fd);
            ktrace!("token {} closed", token);
        }
    }

    /// Stop the workers, then drop every connection
    fn finish(&mut self) {
        self.executor.stop(true);
        while self.requests.pop().is_some() {}
        let open = self.conns.len();
        for (_, entry) in self.conns.drain() {
            let _ = self.poller.delete(entry.fd);
        }
        kinfo!("pool server stopped, {} connections dropped", open);
    }
}
