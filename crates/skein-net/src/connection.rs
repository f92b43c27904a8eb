//! Per-connection non-blocking state machine
//!
//! Driven by the event loop through `on_readable`, `on_writable`,
//! `on_error` and `on_close`. At most one handler runs for a connection at
//! a time, so nothing in here locks.
//!
//! Input flows through a fixed buffer:
//!
//! ```text
//!  socket ──read──> [ input buffer ] ──parser──> command
//!                                    ──copy────> body (+ trailing \r\n)
//!  command + body ──storage──> response ──queue──> writev ──> socket
//! ```
//!
//! The parser keeps its own partial state, so a command may arrive split
//! across any number of reads. Responses queue up in order and drain with
//! scatter writes, tracking how much of the head element already went out.

use crate::interest::Interest;

use skein_core::constants::{DELIMITER, MAX_BODY_SIZE, READ_BUFFER_SIZE};
use skein_core::error::ProtocolError;
use skein_core::protocol::{Command, Parser};
use skein_core::storage::Storage;
use skein_core::{kdebug, ktrace, kwarn};

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::sync::Arc;

/// Responses handed to one `writev`
const MAX_IOVECS: usize = 64;

pub struct Connection<S> {
    stream: S,

    input: Box<[u8]>,
    /// Bytes of `input` holding unprocessed data
    filled: usize,

    parser: Box<dyn Parser>,
    storage: Arc<dyn Storage>,

    /// Decoded header waiting for its body
    pending: Option<Command>,
    body: Vec<u8>,
    /// Body bytes (including the trailing delimiter) still to arrive
    body_remaining: usize,

    responses: VecDeque<Vec<u8>>,
    /// Bytes of the head response already written
    head_written: usize,

    /// Peer finished sending; close once output drains
    read_closed: bool,
    interest: Interest,
    alive: bool,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S, parser: Box<dyn Parser>, storage: Arc<dyn Storage>) -> Self {
        Self {
            stream,
            input: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            filled: 0,
            parser,
            storage,
            pending: None,
            body: Vec::new(),
            body_remaining: 0,
            responses: VecDeque::new(),
            head_written: 0,
            read_closed: false,
            interest: Interest::Read,
            alive: true,
        }
    }

    #[inline]
    pub fn stream(&self) -> &S {
        &self.stream
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        self.interest
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    #[inline]
    pub fn has_pending_output(&self) -> bool {
        !self.responses.is_empty()
    }

    /// Read everything the socket has, executing every complete command
    pub fn on_readable(&mut self) {
        if !self.alive || self.read_closed {
            return;
        }

        loop {
            if self.filled == self.input.len() {
                // Full buffer the parser would not touch
                kwarn!("input buffer full without progress, closing");
                self.respond(ProtocolError::BufferOverflow.to_response());
                self.shutdown_read();
                break;
            }

            match self.stream.read(&mut self.input[self.filled..]) {
                Ok(0) => {
                    if self.filled > 0 || self.pending.is_some() {
                        kdebug!("peer closed mid-command, dropping {} bytes", self.filled);
                    }
                    self.shutdown_read();
                    break;
                }
                Ok(n) => {
                    ktrace!("read {} bytes", n);
                    self.filled += n;
                    self.process();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    kdebug!("read failed: {}", e);
                    self.on_error();
                    return;
                }
            }
        }

        self.update_interest();
    }

    /// Flush queued responses until the socket stops accepting bytes
    pub fn on_writable(&mut self) {
        if !self.alive {
            return;
        }

        while !self.responses.is_empty() {
            let written = {
                let mut iov: Vec<IoSlice<'_>> = Vec::with_capacity(self.responses.len().min(MAX_IOVECS));
                for (i, r) in self.responses.iter().take(MAX_IOVECS).enumerate() {
                    let start = if i == 0 { self.head_written } else { 0 };
                    iov.push(IoSlice::new(&r[start..]));
                }
                self.stream.write_vectored(&iov)
            };

            match written {
                Ok(0) => {
                    kdebug!("write returned 0, closing");
                    self.on_error();
                    return;
                }
                Ok(n) => self.consume_output(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    kdebug!("write failed: {}", e);
                    self.on_error();
                    return;
                }
            }
        }

        if self.responses.is_empty() && self.read_closed {
            self.on_close();
            return;
        }
        self.update_interest();
    }

    /// Socket error: tear the connection down
    pub fn on_error(&mut self) {
        kdebug!("connection error");
        self.on_close();
    }

    /// Mark dead; the event loop deregisters and drops it
    pub fn on_close(&mut self) {
        if self.alive {
            ktrace!("connection closed, {} responses unsent", self.responses.len());
        }
        self.alive = false;
    }

    /// Run the parser and body collection over the buffered input
    fn process(&mut self) {
        let mut pos = 0;

        while pos < self.filled {
            if self.pending.is_none() {
                let (consumed, outcome) = self.parser.parse(&self.input[pos..self.filled]);
                pos += consumed;
                match outcome {
                    Some(Ok(cmd)) => {
                        ktrace!("command {} ({} body bytes)", cmd.name(), cmd.body_len());
                        match body_outstanding(&cmd) {
                            Some(n) => {
                                self.body.clear();
                                self.body_remaining = n;
                                self.pending = Some(cmd);
                            }
                            None => {
                                kdebug!("{} announced {} body bytes", cmd.name(), cmd.body_len());
                                self.respond(ProtocolError::TooLarge(cmd.body_len()).to_response());
                                self.parser.reset();
                            }
                        }
                    }
                    Some(Err(e)) => {
                        kdebug!("protocol error: {}", e);
                        self.respond(e.to_response());
                        self.parser.reset();
                    }
                    None => {}
                }
                if consumed == 0 {
                    // Parser needs more input
                    break;
                }
            }

            if self.pending.is_some() && self.body_remaining > 0 {
                let take = self.body_remaining.min(self.filled - pos);
                self.body.extend_from_slice(&self.input[pos..pos + take]);
                pos += take;
                self.body_remaining -= take;
            }

            if self.pending.is_some() && self.body_remaining == 0 {
                self.execute_pending();
            }
        }

        // Compact: unconsumed bytes move to the front
        self.input.copy_within(pos..self.filled, 0);
        self.filled -= pos;
    }

    fn execute_pending(&mut self) {
        let Some(cmd) = self.pending.take() else {
            return;
        };

        let response = if cmd.has_body() && !self.body.ends_with(DELIMITER) {
            ProtocolError::BadDataChunk.to_response()
        } else {
            if cmd.has_body() {
                self.body.truncate(cmd.body_len());
            }
            match self.storage.execute(&cmd, &self.body) {
                Ok(r) => r,
                Err(e) => {
                    kdebug!("{} failed: {}", cmd.name(), e);
                    e.to_response()
                }
            }
        };

        self.respond(response);
        self.body.clear();
        self.parser.reset();
    }

    fn respond(&mut self, mut bytes: Vec<u8>) {
        bytes.extend_from_slice(DELIMITER);
        self.responses.push_back(bytes);
    }

    /// Drop `n` flushed bytes from the front of the queue
    fn consume_output(&mut self, mut n: usize) {
        while n > 0 {
            let Some(head) = self.responses.front() else {
                break;
            };
            let left = head.len() - self.head_written;
            if n >= left {
                n -= left;
                self.responses.pop_front();
                self.head_written = 0;
            } else {
                self.head_written += n;
                n = 0;
            }
        }
    }

    fn shutdown_read(&mut self) {
        self.read_closed = true;
        if self.responses.is_empty() {
            self.on_close();
        }
    }

    fn update_interest(&mut self) {
        self.interest = match (self.read_closed, self.responses.is_empty()) {
            (false, true) => Interest::Read,
            (false, false) => Interest::ReadWrite,
            (true, _) => Interest::Write,
        };
    }
}

/// Body bytes plus trailing delimiter still to read; None when too large
fn body_outstanding(cmd: &Command) -> Option<usize> {
    if !cmd.has_body() {
        return Some(0);
    }
    if cmd.body_len() > MAX_BODY_SIZE {
        return None;
    }
    cmd.body_len().checked_add(DELIMITER.len())
}

impl<S> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("buffered", &self.filled)
            .field("pending", &self.pending)
            .field("body_remaining", &self.body_remaining)
            .field("responses", &self.responses.len())
            .field("interest", &self.interest)
            .field("alive", &self.alive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_storage::MapStorage;
    use crate::text_protocol::TextParser;
    use parking_lot::Mutex;
    use skein_core::error::StorageError;

    /// Scripted stream: one queued chunk per read, WouldBlock once empty
    #[derive(Default)]
    struct MockStream {
        chunks: VecDeque<Vec<u8>>,
        eof: bool,
        output: Vec<u8>,
        /// Max bytes accepted per write call (0 = unlimited)
        write_limit: usize,
        /// Write calls left before WouldBlock (None = unlimited)
        write_budget: Option<usize>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(mut chunk) = self.chunks.pop_front() else {
                return if self.eof { Ok(0) } else { Err(io::ErrorKind::WouldBlock.into()) };
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(budget) = self.write_budget.as_mut() {
                if *budget == 0 {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                *budget -= 1;
            }
            let n = if self.write_limit == 0 { buf.len() } else { buf.len().min(self.write_limit) };
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Storage that records calls and echoes them back
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Vec<u8>, Vec<u8>)>>,
    }

    impl Storage for Recorder {
        fn execute(&self, command: &Command, body: &[u8]) -> Result<Vec<u8>, StorageError> {
            self.calls
                .lock()
                .push((command.name().to_string(), command.args().to_vec(), body.to_vec()));
            if command.name() == "fail" {
                return Err(StorageError::Internal("disk on fire".into()));
            }
            Ok(format!("OK {}", command.name()).into_bytes())
        }
    }

    fn conn_with(storage: Arc<dyn Storage>) -> Connection<MockStream> {
        Connection::new(MockStream::default(), Box::new(TextParser::new()), storage)
    }

    /// Feed chunks one readiness event at a time, then flush
    fn drive(conn: &mut Connection<MockStream>, chunks: &[&[u8]]) -> Vec<u8> {
        for chunk in chunks {
            conn.stream_mut().chunks.push_back(chunk.to_vec());
            conn.on_readable();
        }
        conn.on_writable();
        std::mem::take(&mut conn.stream_mut().output)
    }

    #[test]
    fn test_split_inline_command() {
        let rec = Arc::new(Recorder::default());
        let mut conn = conn_with(rec.clone());

        let out = drive(&mut conn, &[b"SE".as_slice(), b"T key valu", b"e\r\n"]);

        let calls = rec.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "SET");
        assert_eq!(calls[0].1, b"key value");
        assert!(calls[0].2.is_empty());
        assert_eq!(out, b"OK SET\r\n");
        assert!(conn.is_alive());
    }

    #[test]
    fn test_body_delimiter_stripped() {
        let rec = Arc::new(Recorder::default());
        let mut conn = conn_with(rec.clone());

        drive(&mut conn, &[b"set k 0 0 5\r\nhel".as_slice(), b"lo", b"\r", b"\nget k\r\n"]);

        let calls = rec.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].2, b"hello");
        assert_eq!(calls[1].0, "get");
    }

    #[test]
    fn test_huge_byte_count_answered() {
        let rec = Arc::new(Recorder::default());
        let mut conn = conn_with(rec.clone());

        let header = format!("set k 0 0 {}\r\n", usize::MAX);
        let out = drive(&mut conn, &[header.as_bytes(), b"ping\r\n"]);
        assert_eq!(out, b"SERVER_ERROR object too large for cache\r\nOK ping\r\n");
        assert!(conn.is_alive());
        assert_eq!(rec.calls.lock().len(), 1);
    }

    /// Announces a body of `usize::MAX` bytes for every line
    struct Greedy;

    impl Parser for Greedy {
        fn parse(&mut self, input: &[u8]) -> skein_core::protocol::ParseStep {
            match input.iter().position(|&b| b == b'\n') {
                Some(nl) => (nl + 1, Some(Ok(Command::with_body("set", "k", usize::MAX)))),
                None => (input.len(), None),
            }
        }

        fn reset(&mut self) {}
    }

    #[test]
    fn test_oversized_body_from_any_parser() {
        let rec = Arc::new(Recorder::default());
        let mut conn = Connection::new(MockStream::default(), Box::new(Greedy), rec.clone());

        let out = drive(&mut conn, &[b"anything\n".as_slice()]);
        assert_eq!(out, b"SERVER_ERROR object too large for cache\r\n");
        assert!(conn.is_alive());
        assert!(rec.calls.lock().is_empty());
    }

    #[test]
    fn test_bad_data_chunk() {
        let rec = Arc::new(Recorder::default());
        let mut conn = conn_with(rec.clone());

        let out = drive(&mut conn, &[b"set k 0 0 2\r\nabXYget k\r\n".as_slice()]);
        assert_eq!(out, b"CLIENT_ERROR bad data chunk\r\nOK get\r\n");
        assert_eq!(rec.calls.lock().len(), 1);
    }

    #[test]
    fn test_errors_are_responses() {
        let rec = Arc::new(Recorder::default());
        let mut conn = conn_with(rec);

        let out = drive(&mut conn, &[b"\r\nfail now\r\nset k 0 0 x\r\nping\r\n".as_slice()]);
        assert_eq!(
            out,
            b"CLIENT_ERROR empty command\r\nSERVER_ERROR disk on fire\r\nCLIENT_ERROR bad byte count 'x'\r\nOK ping\r\n"
        );
        assert!(conn.is_alive());
    }

    #[test]
    fn test_every_split_point_gives_same_output() {
        let input: &[u8] = b"set a 0 0 3\r\nxyz\r\nget a\r\nappend a 0 0 1\r\n!\r\nget a b\r\n";

        let whole = {
            let mut conn = conn_with(Arc::new(MapStorage::new()));
            drive(&mut conn, &[input])
        };
        assert!(whole.ends_with(b"VALUE a 0 4\r\nxyz!\r\nEND\r\n"));

        for cut in 1..input.len() {
            let mut conn = conn_with(Arc::new(MapStorage::new()));
            let out = drive(&mut conn, &[&input[..cut], &input[cut..]]);
            assert_eq!(out, whole, "split at {}", cut);
        }

        let mut conn = conn_with(Arc::new(MapStorage::new()));
        let bytes: Vec<&[u8]> = input.chunks(1).collect();
        assert_eq!(drive(&mut conn, &bytes), whole);
    }

    #[test]
    fn test_one_byte_writer_drains_in_order() {
        let mut conn = conn_with(Arc::new(MapStorage::new()));
        conn.stream_mut().write_limit = 1;
        conn.stream_mut().write_budget = Some(0);

        conn.stream_mut()
            .chunks
            .push_back(b"set k 0 0 2\r\nhi\r\nget k\r\ndelete k\r\nget k\r\n".to_vec());
        conn.on_readable();
        assert!(conn.has_pending_output());
        assert_eq!(conn.interest(), Interest::ReadWrite);

        // One byte per readiness event
        let mut events = 0;
        while conn.has_pending_output() {
            conn.stream_mut().write_budget = Some(1);
            conn.on_writable();
            events += 1;
            assert!(events < 1000);
        }

        let expected: &[u8] = b"STORED\r\nVALUE k 0 2\r\nhi\r\nEND\r\nDELETED\r\nEND\r\n";
        assert_eq!(conn.stream().output, expected);
        assert_eq!(events, expected.len());
        assert_eq!(conn.interest(), Interest::Read);
    }

    #[test]
    fn test_eof_flushes_then_closes() {
        let mut conn = conn_with(Arc::new(MapStorage::new()));
        conn.stream_mut().chunks.push_back(b"version\r\n".to_vec());
        conn.stream_mut().eof = true;
        conn.stream_mut().write_budget = Some(0);

        conn.on_readable();
        assert!(conn.is_alive());
        assert_eq!(conn.interest(), Interest::Write);

        conn.stream_mut().write_budget = None;
        conn.on_writable();
        assert!(!conn.is_alive());
        assert!(conn.stream().output.starts_with(b"VERSION "));
    }

    #[test]
    fn test_eof_idle_closes() {
        let mut conn = conn_with(Arc::new(MapStorage::new()));
        conn.stream_mut().eof = true;
        conn.on_readable();
        assert!(!conn.is_alive());
    }

    #[test]
    fn test_large_body_spans_buffers() {
        let storage = Arc::new(MapStorage::new());
        let mut conn = conn_with(storage.clone());

        let value = vec![b'v'; READ_BUFFER_SIZE * 3 + 17];
        let mut req = format!("set big 0 0 {}\r\n", value.len()).into_bytes();
        req.extend_from_slice(&value);
        req.extend_from_slice(b"\r\n");

        let out = drive(&mut conn, &[req.as_slice()]);
        assert_eq!(out, b"STORED\r\n");
        assert_eq!(storage.value("big").unwrap(), value);
    }

    #[test]
    fn test_read_error_kills_connection() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::ConnectionReset.into())
            }
        }
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut conn = Connection::new(Broken, Box::new(TextParser::new()), Arc::new(MapStorage::new()));
        conn.on_readable();
        assert!(!conn.is_alive());
    }

    /// Parser that never consumes anything
    struct Stuck;
    impl Parser for Stuck {
        fn parse(&mut self, _: &[u8]) -> skein_core::protocol::ParseStep {
            (0, None)
        }
        fn reset(&mut self) {}
    }

    #[test]
    fn test_stuck_parser_overflow_closes() {
        let mut conn = Connection::new(MockStream::default(), Box::new(Stuck), Arc::new(MapStorage::new()));
        conn.stream_mut().chunks.push_back(vec![b'x'; READ_BUFFER_SIZE + 1]);
        conn.on_readable();
        assert!(conn.is_alive());
        assert_eq!(conn.interest(), Interest::Write);

        conn.on_writable();
        assert!(!conn.is_alive());
        assert_eq!(conn.stream().output, b"CLIENT_ERROR input buffer overflow\r\n");
    }
}
