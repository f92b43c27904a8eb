//! Error types for the skein substrate
//!
//! Each layer owns one enum. Capacity problems (a full queue, a stopped
//! pool) are values the caller inspects, never panics.

use crate::id::TaskId;
use crate::state::PoolState;
use thiserror::Error;

/// Result type for coroutine engine operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Result type for executor operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors raised by the coroutine engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    /// Engine already holds `max_tasks` live tasks
    #[error("no task slots available")]
    NoSlotsAvailable,

    /// Id refers to a finished task or a recycled slot
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    /// Operation not valid for the task's current state
    #[error("invalid task state for operation")]
    InvalidState,

    /// Called a task-only operation from outside any task
    #[error("not running inside a task")]
    NotInTask,

    /// Engine is already driving tasks on this thread
    #[error("engine already running on this thread")]
    AlreadyRunning,

    /// Stack allocation failed
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Stack memory errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// mmap failed
    #[error("memory allocation failed (errno {0})")]
    AllocationFailed(i32),

    /// mprotect failed
    #[error("memory protection change failed (errno {0})")]
    ProtectionFailed(i32),

    /// Requested stack is too small or overflows
    #[error("invalid stack size {0}")]
    InvalidSize(usize),
}

/// Errors raised by the executor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Queue is at `max_queue_size`
    #[error("task queue full")]
    QueueFull,

    /// Pool is not in the Running state
    #[error("executor not running (state {0})")]
    NotRunning(PoolState),

    /// `start()` called twice
    #[error("executor already started")]
    AlreadyStarted,

    /// OS refused to create a worker thread
    #[error("failed to spawn worker thread: {0}")]
    SpawnFailed(String),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Outcome of a submitted task, seen through its result handle
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Task body panicked; payload rendered as text
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Task was discarded without running
    #[error("task dropped before completion")]
    Dropped,
}

/// Malformed client input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Blank command line
    #[error("empty command")]
    Empty,

    /// Command line exceeded the maximum length
    #[error("line too long ({0} bytes)")]
    LineTooLong(usize),

    /// Announced body length is not a number
    #[error("bad byte count '{0}'")]
    BadByteCount(String),

    /// Body was not followed by the delimiter
    #[error("bad data chunk")]
    BadDataChunk,

    /// Announced body exceeds `MAX_BODY_SIZE`
    #[error("object too large for cache ({0} bytes)")]
    TooLarge(usize),

    /// Input buffer filled up without the parser making progress
    #[error("input buffer overflow")]
    BufferOverflow,
}

/// Storage-defined failures, serialized into the response stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Command name not understood
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Arguments did not fit the command
    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// Engine-side failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Wire form of this error (without the trailing delimiter)
    pub fn to_response(&self) -> Vec<u8> {
        match self {
            StorageError::UnknownCommand(_) => b"ERROR".to_vec(),
            StorageError::BadArguments(msg) => format!("CLIENT_ERROR {}", msg).into_bytes(),
            StorageError::Internal(msg) => format!("SERVER_ERROR {}", msg).into_bytes(),
        }
    }
}

impl ProtocolError {
    /// Wire form of this error (without the trailing delimiter)
    pub fn to_response(&self) -> Vec<u8> {
        match self {
            ProtocolError::TooLarge(_) => b"SERVER_ERROR object too large for cache".to_vec(),
            _ => format!("CLIENT_ERROR {}", self).into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = PoolError::QueueFull;
        assert_eq!(format!("{}", e), "task queue full");

        let e = PoolError::NotRunning(PoolState::Stopping);
        assert_eq!(format!("{}", e), "executor not running (state STOPPING)");

        let e = SchedError::Memory(MemoryError::AllocationFailed(12));
        assert_eq!(format!("{}", e), "memory error: memory allocation failed (errno 12)");
    }

    #[test]
    fn test_error_conversion() {
        let mem_err = MemoryError::InvalidSize(0);
        let sched_err: SchedError = mem_err.into();
        assert!(matches!(sched_err, SchedError::Memory(MemoryError::InvalidSize(0))));
    }

    #[test]
    fn test_storage_error_wire_form() {
        assert_eq!(StorageError::UnknownCommand("FOO".into()).to_response(), b"ERROR");
        assert_eq!(
            StorageError::BadArguments("missing key".into()).to_response(),
            b"CLIENT_ERROR missing key"
        );
        assert_eq!(
            StorageError::Internal("out of memory".into()).to_response(),
            b"SERVER_ERROR out of memory"
        );
    }

    #[test]
    fn test_protocol_error_wire_form() {
        assert_eq!(ProtocolError::BadDataChunk.to_response(), b"CLIENT_ERROR bad data chunk");
        assert_eq!(
            ProtocolError::TooLarge(usize::MAX).to_response(),
            b"SERVER_ERROR object too large for cache"
        );
    }
}
