//! End-to-end: real sockets against both server strategies

use skein_core::{Command, Storage, StorageError};
use skein_net::{MapStorage, Server, ServerConfig, Shutdown, Strategy};
use skein_runtime::{EngineConfig, ExecutorConfig};

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Running {
    addr: SocketAddr,
    shutdown: Shutdown,
    thread: JoinHandle<Result<(), skein_net::ServerError>>,
}

impl Running {
    fn stop(self) {
        self.shutdown.trigger();
        let result = self.thread.join().expect("server thread panicked");
        assert!(result.is_ok(), "server failed: {:?}", result);
    }
}

fn start(strategy: Strategy) -> Running {
    start_with(strategy, Arc::new(MapStorage::new()), 64)
}

fn start_with(strategy: Strategy, storage: Arc<dyn Storage>, max_connections: usize) -> Running {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
        .strategy(strategy)
        .max_connections(max_connections)
        .executor(
            ExecutorConfig::new()
                .low_watermark(1)
                .high_watermark(4)
                .max_queue_size(16)
                .idle_timeout(Duration::from_millis(50)),
        )
        .engine(EngineConfig::new().stack_size(128 * 1024).max_tasks(128));
    let server = Server::bind(config, storage).unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let thread = thread::spawn(move || server.run());
    Running { addr, shutdown, thread }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

/// Read until `expected.len()` bytes arrived
fn expect(stream: &mut TcpStream, expected: &[u8]) {
    let mut got = vec![0u8; expected.len()];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(
        String::from_utf8_lossy(&got),
        String::from_utf8_lossy(expected)
    );
}

fn set_get(strategy: Strategy) {
    let server = start(strategy);
    let mut c = connect(server.addr);

    c.write_all(b"set k 0 0 5\r\nhello\r\n").unwrap();
    expect(&mut c, b"STORED\r\n");
    c.write_all(b"get k\r\n").unwrap();
    expect(&mut c, b"VALUE k 0 5\r\nhello\r\nEND\r\n");
    c.write_all(b"frobnicate\r\n").unwrap();
    expect(&mut c, b"ERROR\r\n");

    drop(c);
    server.stop();
}

fn split_writes(strategy: Strategy) {
    let server = start(strategy);
    let mut c = connect(server.addr);
    c.set_nodelay(true).unwrap();

    for piece in [&b"SE"[..], b"T key valu", b"e\r\nget k", b"ey\r\n"] {
        c.write_all(piece).unwrap();
        thread::sleep(Duration::from_millis(10));
    }
    expect(&mut c, b"STORED\r\nVALUE key 0 5\r\nvalue\r\nEND\r\n");

    drop(c);
    server.stop();
}

fn concurrent_clients(strategy: Strategy) {
    let server = start(strategy);
    let addr = server.addr;

    let clients: Vec<_> = (0..8)
        .map(|i| {
            thread::spawn(move || {
                let mut c = connect(addr);
                for j in 0..20 {
                    let value = format!("v{}-{}", i, j);
                    let req = format!("set c{} 0 0 {}\r\n{}\r\nget c{}\r\n", i, value.len(), value, i);
                    c.write_all(req.as_bytes()).unwrap();
                    let reply = format!(
                        "STORED\r\nVALUE c{} 0 {}\r\n{}\r\nEND\r\n",
                        i,
                        value.len(),
                        value
                    );
                    expect(&mut c, reply.as_bytes());
                }
            })
        })
        .collect();
    for c in clients {
        c.join().unwrap();
    }

    server.stop();
}

fn half_close_flushes(strategy: Strategy) {
    let server = start(strategy);
    let mut c = connect(server.addr);

    c.write_all(b"set a 0 0 1\r\nx\r\nget a\r\n").unwrap();
    c.shutdown(std::net::Shutdown::Write).unwrap();
    let mut all = Vec::new();
    c.read_to_end(&mut all).unwrap();
    assert_eq!(all, b"STORED\r\nVALUE a 0 1\r\nx\r\nEND\r\n");

    server.stop();
}

/// Panics on `boom`, otherwise a plain map
#[derive(Default)]
struct Explosive(MapStorage);

impl Storage for Explosive {
    fn execute(&self, command: &Command, body: &[u8]) -> Result<Vec<u8>, StorageError> {
        if command.name() == "boom" {
            panic!("storage exploded");
        }
        self.0.execute(command, body)
    }
}

fn handler_panic_frees_slot(strategy: Strategy) {
    let server = start_with(strategy, Arc::new(Explosive::default()), 2);

    // More panics than slots: each one must give its slot back
    for _ in 0..4 {
        let mut c = connect(server.addr);
        c.write_all(b"boom\r\n").unwrap();
        let mut buf = [0u8; 16];
        match c.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0, "got {:?}", String::from_utf8_lossy(&buf[..n])),
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
        }
    }

    let mut c = connect(server.addr);
    c.write_all(b"set k 0 0 2\r\nok\r\nget k\r\n").unwrap();
    expect(&mut c, b"STORED\r\nVALUE k 0 2\r\nok\r\nEND\r\n");

    drop(c);
    server.stop();
}

#[test]
fn test_pool_set_get() {
    set_get(Strategy::Pool);
}

#[test]
fn test_coroutine_set_get() {
    set_get(Strategy::Coroutine);
}

#[test]
fn test_pool_split_writes() {
    split_writes(Strategy::Pool);
}

#[test]
fn test_coroutine_split_writes() {
    split_writes(Strategy::Coroutine);
}

#[test]
fn test_pool_concurrent_clients() {
    concurrent_clients(Strategy::Pool);
}

#[test]
fn test_coroutine_concurrent_clients() {
    concurrent_clients(Strategy::Coroutine);
}

#[test]
fn test_pool_half_close_flushes() {
    half_close_flushes(Strategy::Pool);
}

#[test]
fn test_coroutine_half_close_flushes() {
    half_close_flushes(Strategy::Coroutine);
}

#[test]
fn test_pool_handler_panic_frees_slot() {
    handler_panic_frees_slot(Strategy::Pool);
}

#[test]
fn test_coroutine_handler_panic_frees_slot() {
    handler_panic_frees_slot(Strategy::Coroutine);
}

#[test]
fn test_shutdown_with_open_connection() {
    for strategy in [Strategy::Pool, Strategy::Coroutine] {
        let server = start(strategy);
        let mut c = connect(server.addr);
        c.write_all(b"version\r\n").unwrap();
        let mut line = [0u8; 8];
        c.read_exact(&mut line).unwrap();
        assert_eq!(&line, b"VERSION ");
        server.stop();
    }
}
