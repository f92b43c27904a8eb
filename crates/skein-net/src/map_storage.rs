//! In-memory reference storage
//!
//! Speaks the subset of the memcached text protocol the server needs for
//! testing and demos. Expiration times are accepted and ignored.
//!
//! | command | reply |
//! |---------|-------|
//! | `get <key>*` / `gets` | `VALUE <key> <flags> <bytes>` + data per hit, then `END` |
//! | `set add replace append prepend` | `STORED` / `NOT_STORED` |
//! | `delete <key>` | `DELETED` / `NOT_FOUND` |
//! | `flush_all` | `OK` |
//! | `version` | `VERSION <crate version>` |

use parking_lot::RwLock;
use skein_core::error::StorageError;
use skein_core::protocol::Command;
use skein_core::storage::Storage;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Entry {
    flags: u32,
    value: Vec<u8>,
}

/// `HashMap` behind a reader-writer lock
#[derive(Debug, Default)]
pub struct MapStorage {
    map: RwLock<HashMap<String, Entry>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Store {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

fn bad(msg: &str) -> StorageError {
    StorageError::BadArguments(msg.to_string())
}

impl MapStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Stored value for `key`, if any
    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.map.read().get(key).map(|e| e.value.clone())
    }

    fn get(&self, keys: &[&str]) -> Result<Vec<u8>, StorageError> {
        if keys.is_empty() {
            return Err(bad("missing key"));
        }
        let map = self.map.read();
        let mut out = Vec::new();
        for key in keys {
            if let Some(e) = map.get(*key) {
                out.extend_from_slice(
                    format!("VALUE {} {} {}\r\n", key, e.flags, e.value.len()).as_bytes(),
                );
                out.extend_from_slice(&e.value);
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"END");
        Ok(out)
    }

    fn store(&self, op: Store, key: &str, flags: u32, value: &[u8]) -> Vec<u8> {
        let mut map = self.map.write();
        let stored = match (op, map.get_mut(key)) {
            (Store::Set, _) | (Store::Add, None) | (Store::Replace, Some(_)) => {
                map.insert(key.to_string(), Entry { flags, value: value.to_vec() });
                true
            }
            (Store::Append, Some(e)) => {
                e.value.extend_from_slice(value);
                true
            }
            (Store::Prepend, Some(e)) => {
                let mut v = value.to_vec();
                v.extend_from_slice(&e.value);
                e.value = v;
                true
            }
            _ => false,
        };
        if stored { b"STORED".to_vec() } else { b"NOT_STORED".to_vec() }
    }
}

impl Storage for MapStorage {
    fn execute(&self, command: &Command, body: &[u8]) -> Result<Vec<u8>, StorageError> {
        let args = std::str::from_utf8(command.args()).map_err(|_| bad("arguments not utf-8"))?;
        let tokens: Vec<&str> = args.split_ascii_whitespace().collect();

        let op = match command.name().to_ascii_lowercase().as_str() {
            "get" | "gets" => return self.get(&tokens),
            "delete" => {
                let key = tokens.first().ok_or_else(|| bad("missing key"))?;
                let removed = self.map.write().remove(*key).is_some();
                return Ok(if removed { b"DELETED".to_vec() } else { b"NOT_FOUND".to_vec() });
            }
            "flush_all" => {
                self.map.write().clear();
                return Ok(b"OK".to_vec());
            }
            "version" => {
                return Ok(format!("VERSION {}", env!("CARGO_PKG_VERSION")).into_bytes());
            }
            "set" => Store::Set,
            "add" => Store::Add,
            "replace" => Store::Replace,
            "append" => Store::Append,
            "prepend" => Store::Prepend,
            _ => return Err(StorageError::UnknownCommand(command.name().to_string())),
        };

        let key = *tokens.first().ok_or_else(|| bad("missing key"))?;
        if command.has_body() {
            let flags = tokens
                .get(1)
                .and_then(|f| f.parse::<u32>().ok())
                .ok_or_else(|| bad("bad command line format"))?;
            Ok(self.store(op, key, flags, body))
        } else {
            // Inline form: everything after the key is the value
            let value = args.trim_start()[key.len()..].trim();
            if value.is_empty() {
                return Err(bad("missing value"));
            }
            Ok(self.store(op, key, 0, value.as_bytes()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(s: &MapStorage, name: &str, args: &str) -> Result<Vec<u8>, StorageError> {
        s.execute(&Command::new(name, args, 0), &[])
    }

    fn put(s: &MapStorage, name: &str, args: &str, body: &[u8]) -> Result<Vec<u8>, StorageError> {
        s.execute(&Command::with_body(name, args, body.len()), body)
    }

    #[test]
    fn test_set_and_get() {
        let s = MapStorage::new();
        assert_eq!(put(&s, "set", "k 3 0 5", b"hello").unwrap(), b"STORED");
        assert_eq!(run(&s, "get", "k").unwrap(), b"VALUE k 3 5\r\nhello\r\nEND");
        assert_eq!(run(&s, "get", "missing").unwrap(), b"END");
    }

    #[test]
    fn test_inline_set() {
        let s = MapStorage::new();
        assert_eq!(run(&s, "SET", "key value").unwrap(), b"STORED");
        assert_eq!(s.value("key").unwrap(), b"value");
        assert_eq!(run(&s, "SET", "  key   two words ").unwrap(), b"STORED");
        assert_eq!(s.value("key").unwrap(), b"two words");
        assert!(run(&s, "SET", "key").is_err());
    }

    #[test]
    fn test_multi_get() {
        let s = MapStorage::new();
        put(&s, "set", "a 0 0 1", b"1").unwrap();
        put(&s, "set", "b 0 0 2", b"22").unwrap();
        assert_eq!(
            run(&s, "get", "a x b").unwrap(),
            b"VALUE a 0 1\r\n1\r\nVALUE b 0 2\r\n22\r\nEND"
        );
    }

    #[test]
    fn test_conditional_stores() {
        let s = MapStorage::new();
        assert_eq!(put(&s, "replace", "k 0 0 1", b"x").unwrap(), b"NOT_STORED");
        assert_eq!(put(&s, "add", "k 0 0 1", b"b").unwrap(), b"STORED");
        assert_eq!(put(&s, "add", "k 0 0 1", b"z").unwrap(), b"NOT_STORED");
        assert_eq!(put(&s, "append", "k 0 0 1", b"c").unwrap(), b"STORED");
        assert_eq!(put(&s, "prepend", "k 0 0 1", b"a").unwrap(), b"STORED");
        assert_eq!(s.value("k").unwrap(), b"abc");
        assert_eq!(put(&s, "append", "nope 0 0 1", b"c").unwrap(), b"NOT_STORED");
    }

    #[test]
    fn test_delete_and_flush() {
        let s = MapStorage::new();
        put(&s, "set", "k 0 0 1", b"v").unwrap();
        assert_eq!(run(&s, "delete", "k").unwrap(), b"DELETED");
        assert_eq!(run(&s, "delete", "k").unwrap(), b"NOT_FOUND");
        put(&s, "set", "k 0 0 1", b"v").unwrap();
        assert_eq!(run(&s, "flush_all", "").unwrap(), b"OK");
        assert!(s.is_empty());
    }

    #[test]
    fn test_errors() {
        let s = MapStorage::new();
        assert_eq!(
            run(&s, "frobnicate", ""),
            Err(StorageError::UnknownCommand("frobnicate".into()))
        );
        assert!(matches!(run(&s, "get", ""), Err(StorageError::BadArguments(_))));
        assert!(matches!(
            put(&s, "set", "k x 0 1", b"v"),
            Err(StorageError::BadArguments(_))
        ));
    }
}
