//! Kernel-style log macros for skein
//!
//! Thin leveled front-end over `tracing`. Events carry the usual tracing
//! metadata (target, thread name); `init()` installs a `tracing-subscriber`
//! fmt subscriber writing to stderr.
//!
//! # Environment Variables
//!
//! - `SKEIN_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//!   (names are accepted too)
//!
//! # Usage
//!
//! ```ignore
//! use skein_core::{kdebug, kinfo, kwarn, kerror};
//!
//! kinfo!("worker {} started", id);
//! kdebug!(fd = sock, "read {} bytes", n);
//! kwarn!("unexpected state: {:?}", state);
//! kerror!("critical failure!");
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::level_filters::LevelFilter;

#[doc(hidden)]
pub use tracing as __tracing;

/// Log levels (matches common conventions)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit; unknown text yields `None`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Equivalent tracing filter
    pub fn as_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize logging from `SKEIN_LOG_LEVEL`
///
/// Safe to call more than once; the first call wins.
pub fn init() {
    let level = std::env::var("SKEIN_LOG_LEVEL")
        .ok()
        .and_then(|v| LogLevel::parse(&v))
        .unwrap_or(LogLevel::Info);
    init_with_level(level);
}

/// Initialize logging with an explicit level, ignoring the environment
pub fn init_with_level(level: LogLevel) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);

    // Another subscriber may already be installed (tests, embedding apps)
    let _ = tracing_subscriber::fmt()
        .with_max_level(level.as_filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .with_ansi(false)
        .try_init();
}

/// Get current log level
#[inline]
pub fn log_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Check if a log level is enabled
#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 <= log_level() as u8
}

// ============================================================================
// Public Macros
// ============================================================================

/// Error level log (always shown unless logging is off)
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        if $crate::kprint::level_enabled($crate::kprint::LogLevel::Error) {
            $crate::kprint::__tracing::error!($($arg)*);
        }
    }};
}

/// Warning level log
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        if $crate::kprint::level_enabled($crate::kprint::LogLevel::Warn) {
            $crate::kprint::__tracing::warn!($($arg)*);
        }
    }};
}

/// Info level log
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        if $crate::kprint::level_enabled($crate::kprint::LogLevel::Info) {
            $crate::kprint::__tracing::info!($($arg)*);
        }
    }};
}

/// Debug level log
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        if $crate::kprint::level_enabled($crate::kprint::LogLevel::Debug) {
            $crate::kprint::__tracing::debug!($($arg)*);
        }
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        if $crate::kprint::level_enabled($crate::kprint::LogLevel::Trace) {
            $crate::kprint::__tracing::trace!($($arg)*);
        }
    }};
}

// ============================================================================
// Tests
// ============================================================================
