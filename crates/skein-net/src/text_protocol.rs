//! Memcached-style text protocol parser
//!
//! One command per line, terminated by `\n` (an optional `\r` before it is
//! dropped). Storage commands announce a body on the following line:
//!
//! ```text
//! set <key> <flags> <exptime> <bytes> [noreply]\r\n
//! <data block of <bytes> bytes>\r\n
//! ```
//!
//! Other commands are a single line. `SET key value` (fewer than four
//! arguments) is the inline form and carries no body.

use skein_core::constants::{MAX_BODY_SIZE, MAX_LINE_LENGTH};
use skein_core::error::ProtocolError;
use skein_core::protocol::{Command, ParseStep, Parser};
use skein_core::ktrace;

/// Commands followed by a data block
const STORAGE_COMMANDS: &[&str] = &["set", "add", "replace", "append", "prepend"];

/// Line parser that buffers partial lines internally
#[derive(Debug, Default)]
pub struct TextParser {
    line: Vec<u8>,
    /// Bytes of the current line seen so far, including dropped ones
    seen: usize,
    /// Line grew past the limit; swallow it up to the newline
    overflow: bool,
}

impl TextParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&mut self, chunk: &[u8]) {
        self.seen += chunk.len();
        if self.overflow {
            return;
        }
        if self.seen > MAX_LINE_LENGTH {
            self.overflow = true;
            self.line = Vec::new();
        } else {
            self.line.extend_from_slice(chunk);
        }
    }

    fn finish_line(&mut self) -> Result<Command, ProtocolError> {
        let result = if self.overflow {
            Err(ProtocolError::LineTooLong(self.seen))
        } else {
            decode(&self.line)
        };
        self.line.clear();
        self.seen = 0;
        self.overflow = false;
        result
    }
}

impl Parser for TextParser {
    fn parse(&mut self, input: &[u8]) -> ParseStep {
        match input.iter().position(|&b| b == b'\n') {
            Some(nl) => {
                self.take(&input[..nl]);
                (nl + 1, Some(self.finish_line()))
            }
            None => {
                self.take(input);
                (input.len(), None)
            }
        }
    }

    fn reset(&mut self) {
        self.line.clear();
        self.seen = 0;
        self.overflow = false;
    }
}

fn decode(line: &[u8]) -> Result<Command, ProtocolError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line).trim_ascii();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }

    let (name, args) = match line.iter().position(|b| b.is_ascii_whitespace()) {
        Some(sp) => (&line[..sp], line[sp..].trim_ascii()),
        None => (line, &[][..]),
    };
    let name = String::from_utf8_lossy(name).into_owned();

    let is_storage = STORAGE_COMMANDS.iter().any(|c| name.eq_ignore_ascii_case(c));
    if is_storage {
        let tokens: Vec<&[u8]> = args
            .split(|b| b.is_ascii_whitespace())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.len() >= 4 {
            let bytes = tokens[3];
            let body_len = std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| {
                    ProtocolError::BadByteCount(String::from_utf8_lossy(bytes).into_owned())
                })?;
            if body_len > MAX_BODY_SIZE {
                return Err(ProtocolError::TooLarge(body_len));
            }
            ktrace!("parsed {} with {} byte body", name, body_len);
            return Ok(Command::with_body(name, args, body_len));
        }
    }

    Ok(Command::new(name, args, 0))
}
