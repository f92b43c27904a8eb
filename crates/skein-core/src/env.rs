//! Environment overrides for runtime configuration
//!
//! Every tunable in skein has a compile-time default (see `constants`)
//! that a `SKEIN_*` variable can replace at startup. Unparseable values
//! fall back to the default rather than failing the process.
//!
//! ```ignore
//! use skein_core::env::{env_get, env_get_ms};
//!
//! let high: usize = env_get("SKEIN_POOL_HIGH", 6);
//! let idle = env_get_ms("SKEIN_POOL_IDLE_MS", Duration::from_millis(100));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Read `key` and parse it as `T`, or return `default`
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Read `key` as a flag. "1", "true", "yes", "on" (any case) mean true,
/// any other value means false; an unset key yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Read `key` and parse it as `T`; `None` when unset or malformed
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Read `key` as a whole number of milliseconds
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Read `key` verbatim, or return `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
