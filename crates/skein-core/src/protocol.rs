//! Wire-protocol parser contract
//!
//! The connection state machine does not know the protocol. It feeds raw
//! bytes to a [`Parser`], which reports how much it consumed and, once a
//! command header is complete, a [`Command`] describing what to run and
//! how many body bytes follow.

use crate::error::ProtocolError;

/// A decoded command header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<u8>,
    body_len: usize,
    /// A body section follows, even when `body_len` is 0
    body: bool,
}

impl Command {
    /// Header whose body (if `body_len > 0`) follows on the wire
    pub fn new(name: impl Into<String>, args: impl Into<Vec<u8>>, body_len: usize) -> Self {
        Self {
            name: name.into(),
            args: args.into(),
            body_len,
            body: body_len > 0,
        }
    }

    /// Header that always carries a body section, possibly empty
    pub fn with_body(name: impl Into<String>, args: impl Into<Vec<u8>>, body_len: usize) -> Self {
        Self {
            body: true,
            ..Self::new(name, args, body_len)
        }
    }

    /// Command name as sent by the client
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inline arguments (rest of the header line)
    #[inline]
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    /// Body bytes that follow the header, excluding the trailing delimiter
    #[inline]
    pub fn body_len(&self) -> usize {
        self.body_len
    }

    #[inline]
    pub fn has_body(&self) -> bool {
        self.body
    }
}

/// One step of incremental parsing: bytes consumed plus, when a header
/// line completed, the decoded command or the reason it was rejected.
pub type ParseStep = (usize, Option<Result<Command, ProtocolError>>);

/// Restartable command parser
///
/// Implementations keep whatever partial state they need between calls,
/// so a header split across any number of reads decodes the same as one
/// delivered whole. Consuming zero bytes means "need more input".
pub trait Parser: Send {
    /// Consume a prefix of `input`
    fn parse(&mut self, input: &[u8]) -> ParseStep;

    /// Forget any partial header; called after every full command
    fn reset(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_accessors() {
        let cmd = Command::new("set", b"k 0 0 5".to_vec(), 5);
        assert_eq!(cmd.name(), "set");
        assert_eq!(cmd.args(), b"k 0 0 5");
        assert_eq!(cmd.body_len(), 5);
        assert!(cmd.has_body());

        let cmd = Command::new("GET", "k", 0);
        assert!(!cmd.has_body());

        let cmd = Command::with_body("set", "k 0 0 0", 0);
        assert!(cmd.has_body());
        assert_eq!(cmd.body_len(), 0);
    }
}
