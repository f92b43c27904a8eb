//! skein key-value server
//!
//! Serves the memcached-style text protocol from an in-memory map on
//! either execution strategy.
//!
//! Usage:
//!     cargo build --release -p skein-server
//!     ./target/release/skein-server --addr 127.0.0.1:11211 --strategy pool
//!     ./target/release/skein-server --strategy coroutine --stack-size 131072
//!
//! Test with:
//!     printf 'set k 0 0 5\r\nhello\r\nget k\r\n' | nc -q1 localhost 11211
//!
//! Flags left unset fall back to the `SKEIN_*` environment variables.

use clap::Parser;
use skein_core::kprint::{self, LogLevel};
use skein_core::{kerror, kinfo};
use skein_net::{MapStorage, Server, ServerConfig, Strategy};

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "skein-server", version, about = "In-memory key-value server")]
struct Args {
    /// Listen address
    #[arg(short, long)]
    addr: Option<SocketAddr>,

    /// Execution strategy: pool or coroutine
    #[arg(short, long)]
    strategy: Option<Strategy>,

    /// Connections beyond this are refused
    #[arg(long)]
    max_connections: Option<usize>,

    /// Disable Nagle on accepted sockets (true/false)
    #[arg(long)]
    tcp_nodelay: Option<bool>,

    /// Workers kept alive when idle (pool)
    #[arg(long)]
    pool_low: Option<usize>,

    /// Upper bound on workers (pool)
    #[arg(long)]
    pool_high: Option<usize>,

    /// Pending jobs before submissions are refused (pool)
    #[arg(long)]
    pool_queue: Option<usize>,

    /// Idle milliseconds before a surplus worker retires (pool)
    #[arg(long)]
    pool_idle_ms: Option<u64>,

    /// Bytes of stack per connection task (coroutine)
    #[arg(long)]
    stack_size: Option<usize>,

    /// Log level: off, error, warn, info, debug, trace
    #[arg(short, long)]
    log: Option<String>,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn config_from(args: &Args) -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    if let Some(n) = args.max_connections {
        config.max_connections = n;
    }
    if let Some(on) = args.tcp_nodelay {
        config.nodelay = on;
    }

    let mut pool = config.executor.clone();
    if let Some(n) = args.pool_low {
        pool = pool.low_watermark(n);
    }
    if let Some(n) = args.pool_high {
        pool = pool.high_watermark(n);
    }
    if let Some(n) = args.pool_queue {
        pool = pool.max_queue_size(n);
    }
    if let Some(ms) = args.pool_idle_ms {
        pool = pool.idle_timeout(Duration::from_millis(ms));
    }

    let mut engine = config.engine.clone();
    if let Some(bytes) = args.stack_size {
        engine = engine.stack_size(bytes);
    }

    config.executor(pool).engine(engine)
}

fn main() -> ExitCode {
    let args = Args::parse();
    match args.log.as_deref().and_then(LogLevel::parse) {
        Some(level) => kprint::init_with_level(level),
        None => kprint::init(),
    }

    let config = config_from(&args);
    let server = match Server::bind(config, Arc::new(MapStorage::new())) {
        Ok(s) => s,
        Err(e) => {
            kerror!("bind failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // SIGINT/SIGTERM only raise a flag; a watcher thread turns it into a shutdown
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }
    let shutdown = server.shutdown_handle();
    let watcher = thread::Builder::new()
        .name("skein-signal".into())
        .spawn(move || {
            while !STOP.load(Ordering::SeqCst) && !shutdown.is_triggered() {
                thread::sleep(Duration::from_millis(100));
            }
            kinfo!("shutting down");
            shutdown.trigger();
        });
    if let Err(e) = watcher {
        kerror!("signal watcher: {}", e);
        return ExitCode::FAILURE;
    }

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            kerror!("server failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
