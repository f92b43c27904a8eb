//! # skein-runtime
//!
//! Execution contexts for the skein server substrate.
//!
//! This crate provides:
//! - `Executor` - dynamically sized worker thread pool with watermarks
//! - `Engine` - cooperative coroutine engine, one OS thread, many tasks
//! - Context switching (architecture-specific assembly)
//! - Coroutine stacks (mmap with guard pages)

pub mod config;
pub mod memory;
pub mod arch;
pub mod coroutine;
pub mod executor;

// Re-exports
pub use config::{EngineConfig, ExecutorConfig};
pub use coroutine::Engine;
pub use executor::{Executor, TaskHandle};

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}

/// Render a caught panic payload as text
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
