//! Storage engine contract
//!
//! Storage is synchronous from the caller's point of view. On the thread
//! pool each call occupies only its own worker; on the coroutine engine a
//! long call stalls the whole loop, so engines used there must be fast.

use crate::error::StorageError;
use crate::protocol::Command;
use std::sync::Arc;

/// Executes decoded commands
pub trait Storage: Send + Sync {
    /// Run `command` with its `body` (empty for bodiless commands).
    ///
    /// The returned bytes are the response payload; the caller appends
    /// the delimiter.
    fn execute(&self, command: &Command, body: &[u8]) -> Result<Vec<u8>, StorageError>;
}

impl<T: Storage + ?Sized> Storage for Arc<T> {
    fn execute(&self, command: &Command, body: &[u8]) -> Result<Vec<u8>, StorageError> {
        (**self).execute(command, body)
    }
}
