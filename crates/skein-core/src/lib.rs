//! # skein-core
//!
//! Core types and contracts for the skein server substrate.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The thread pool and coroutine engine live in `skein-runtime`, the
//! connection state machine and event loops in `skein-net`.
//!
//! ## Modules
//!
//! - `id` - task and worker identifiers
//! - `state` - task and pool lifecycle enums
//! - `error` - error types for every layer
//! - `protocol` - the wire-protocol parser contract
//! - `storage` - the storage engine contract
//! - `kprint` - kernel-style logging macros on top of `tracing`
//! - `env` - environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod protocol;
pub mod storage;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{TaskId, WorkerId};
pub use state::{PoolState, TaskState};
pub use error::{
    MemoryError, PoolError, PoolResult, ProtocolError, SchedError, SchedResult, StorageError,
    TaskError,
};
pub use protocol::{Command, Parser};
pub use storage::Storage;
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt, env_get_str};

/// Compile-time defaults
pub mod constants {
    /// Default coroutine stack size (256 KB)
    pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

    /// Smallest stack the engine accepts
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Guard page below every coroutine stack
    pub const GUARD_SIZE: usize = 4096;

    /// Default maximum live coroutines per engine
    pub const DEFAULT_MAX_TASKS: usize = 65536;

    /// Default executor watermarks and queue depth
    pub const DEFAULT_LOW_WATERMARK: usize = 1;
    pub const DEFAULT_HIGH_WATERMARK: usize = 6;
    pub const DEFAULT_MAX_QUEUE_SIZE: usize = 64;

    /// Default idle time before a surplus worker retires (ms)
    pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 100;

    /// Per-connection input buffer capacity
    pub const READ_BUFFER_SIZE: usize = 4096;

    /// Longest command line the text protocol accepts
    pub const MAX_LINE_LENGTH: usize = 2048;

    /// Largest command body a connection will buffer (1 MB)
    pub const MAX_BODY_SIZE: usize = 1024 * 1024;

    /// Response / body delimiter
    pub const DELIMITER: &[u8] = b"\r\n";
}
