//! Server strategies
//!
//! Both strategies share the listener, the storage and the shutdown
//! handle, and drive the same [`Connection`](crate::Connection) state
//! machine:
//!
//! - [`Strategy::Pool`] - a reactor thread owns epoll and hands every ready
//!   connection to an [`Executor`](skein_runtime::Executor) worker
//! - [`Strategy::Coroutine`] - one thread, one
//!   [`Engine`](skein_runtime::Engine), a task per connection

mod coroutine;
mod pool;

use crate::connection::Connection;
use crate::poller::{Notifier, Readiness};

use skein_core::error::{PoolError, SchedError};
use skein_core::storage::Storage;
use skein_core::{env_get, env_get_bool, env_get_str, kdebug, kinfo, kwarn};
use skein_runtime::{EngineConfig, ExecutorConfig};

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Epoll token of the listening socket
pub(crate) const LISTENER_TOKEN: u64 = 0;
/// Epoll token of the shutdown notifier
pub(crate) const NOTIFY_TOKEN: u64 = 1;
/// First token handed to a connection
pub(crate) const FIRST_CONN_TOKEN: u64 = 2;

/// Epoll events fetched per wait
pub(crate) const EVENTS_PER_WAIT: usize = 256;

/// Errors that stop a server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("executor: {0}")]
    Pool(#[from] PoolError),

    #[error("coroutine engine: {0}")]
    Sched(#[from] SchedError),
}

/// How connections are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Reactor thread plus executor workers
    Pool,
    /// Single thread, cooperative tasks
    Coroutine,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pool" | "mt" | "threads" => Ok(Strategy::Pool),
            "coroutine" | "st" | "coro" => Ok(Strategy::Coroutine),
            other => Err(format!("unknown strategy '{}' (expected pool|coroutine)", other)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Pool => write!(f, "pool"),
            Strategy::Coroutine => write!(f, "coroutine"),
        }
    }
}

/// Server configuration
///
/// Env overrides: `SKEIN_ADDR`, `SKEIN_STRATEGY`, `SKEIN_MAX_CONNECTIONS`,
/// `SKEIN_TCP_NODELAY`, plus everything [`ExecutorConfig`] and [`EngineConfig`] read.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub strategy: Strategy,
    /// Accepted connections beyond this are closed at once
    pub max_connections: usize,
    /// Disable Nagle on accepted sockets
    pub nodelay: bool,
    pub executor: ExecutorConfig,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let addr = env_get_str("SKEIN_ADDR", "127.0.0.1:11211")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 11211)));
        let strategy = env_get_str("SKEIN_STRATEGY", "pool")
            .parse()
            .unwrap_or(Strategy::Pool);
        Self {
            addr,
            strategy,
            max_connections: env_get("SKEIN_MAX_CONNECTIONS", 1024),
            nodelay: env_get_bool("SKEIN_TCP_NODELAY", true),
            executor: ExecutorConfig::from_env().name("skein-conn"),
            engine: EngineConfig::from_env(),
        }
    }
}

impl ServerConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, ..Self::default() }
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn nodelay(mut self, on: bool) -> Self {
        self.nodelay = on;
        self
    }

    pub fn executor(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    pub fn engine(mut self, config: EngineConfig) -> Self {
        self.engine = config;
        self
    }
}

/// Stops a running server from any thread
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
}

impl Shutdown {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = self.notifier.notify();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Bound listener plus everything a strategy needs to serve it
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    storage: Arc<dyn Storage>,
    shutdown: Shutdown,
}

impl Server {
    /// Bind the listening socket; nothing is served until [`run`](Self::run)
    pub fn bind(config: ServerConfig, storage: Arc<dyn Storage>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.addr)?;
        listener.set_nonblocking(true)?;
        let shutdown = Shutdown {
            flag: Arc::new(AtomicBool::new(false)),
            notifier: Arc::new(Notifier::new()?),
        };
        Ok(Self { config, listener, storage, shutdown })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve until the shutdown handle fires; blocks the calling thread
    pub fn run(self) -> Result<(), ServerError> {
        kinfo!(
            "serving on {} with {} strategy",
            self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            self.config.strategy
        );
        match self.config.strategy {
            Strategy::Pool => pool::run(self),
            Strategy::Coroutine => coroutine::run(self),
        }
    }
}

/// Route one readiness report into the state machine
///
/// Reads first so responses produced by this batch go out in the same
/// turn when the socket accepts them.
pub(crate) fn dispatch<S: Read + Write>(conn: &mut Connection<S>, ready: Readiness) {
    if ready.error {
        conn.on_error();
        return;
    }
    if ready.readable || ready.hangup {
        conn.on_readable();
    }
    if ready.writable || conn.has_pending_output() {
        conn.on_writable();
    }
}

/// Accept until the listener would block, handing each prepared socket
/// to `on_accept`, which returns whether it kept the socket. `live` is
/// the connection count going in.
pub(crate) fn accept_ready(
    listener: &TcpListener,
    config: &ServerConfig,
    mut live: usize,
    mut on_accept: impl FnMut(TcpStream, SocketAddr) -> bool,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if live >= config.max_connections {
                    kwarn!("connection limit {} reached, refusing {}", config.max_connections, peer);
                    continue;
                }
                if let Err(e) = stream.set_nonblocking(true) {
                    kdebug!("dropping {}: {}", peer, e);
                    continue;
                }
                if let Err(e) = stream.set_nodelay(config.nodelay) {
                    kdebug!("nodelay on {}: {}", peer, e);
                }
                if on_accept(stream, peer) {
                    live += 1;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EMFILE and friends: retry on the next readiness event
                kwarn!("accept failed: {}", e);
                break;
            }
        }
    }
}
