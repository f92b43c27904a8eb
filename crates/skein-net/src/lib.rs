//! # skein-net
//!
//! Networking layer of the skein key-value server.
//!
//! - `connection` - per-socket non-blocking state machine
//! - `text_protocol` - line-oriented memcached-style parser
//! - `map_storage` - in-memory reference storage
//! - `poller` - epoll wrapper and eventfd notifier
//! - `server` - thread-pool and coroutine server strategies
//!
//! The state machine is generic over any `Read + Write` stream, so it runs
//! unchanged on either strategy and against in-memory test streams.

pub mod interest;
pub mod connection;
pub mod text_protocol;
pub mod map_storage;
pub mod server;

// Readiness comes from epoll
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod poller;
    } else {
        compile_error!("skein-net requires epoll (linux)");
    }
}

pub use interest::Interest;
pub use connection::Connection;
pub use text_protocol::TextParser;
pub use map_storage::MapStorage;
pub use poller::{Events, Notifier, Poller, Readiness};
pub use server::{Server, ServerConfig, ServerError, Shutdown, Strategy};
