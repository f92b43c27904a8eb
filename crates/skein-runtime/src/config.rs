//! Runtime configuration
//!
//! Defaults come from `skein_core::constants`; every field can be
//! overridden from the environment and then adjusted with builder setters.
//!
//! | variable | field |
//! |----------|-------|
//! | `SKEIN_POOL_LOW` | `ExecutorConfig::low_watermark` |
//! | `SKEIN_POOL_HIGH` | `ExecutorConfig::high_watermark` |
//! | `SKEIN_POOL_QUEUE` | `ExecutorConfig::max_queue_size` |
//! | `SKEIN_POOL_IDLE_MS` | `ExecutorConfig::idle_timeout` |
//! | `SKEIN_STACK_SIZE` | `EngineConfig::stack_size` |
//! | `SKEIN_MAX_TASKS` | `EngineConfig::max_tasks` |

use skein_core::constants::{
    DEFAULT_HIGH_WATERMARK, DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_LOW_WATERMARK,
    DEFAULT_MAX_QUEUE_SIZE, DEFAULT_MAX_TASKS, DEFAULT_STACK_SIZE, MIN_STACK_SIZE,
};
use skein_core::{env_get, env_get_ms};
use std::time::Duration;

/// Thread pool configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker thread name prefix
    pub name: String,

    /// Threads kept alive while running
    pub low_watermark: usize,

    /// Hard cap on live threads
    pub high_watermark: usize,

    /// Queued (not yet started) tasks before submissions are rejected
    pub max_queue_size: usize,

    /// How long a surplus worker waits for work before retiring
    pub idle_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile-time defaults with `SKEIN_POOL_*` overrides applied
    pub fn from_env() -> Self {
        Self {
            name: "skein-worker".to_string(),
            low_watermark: env_get("SKEIN_POOL_LOW", DEFAULT_LOW_WATERMARK),
            high_watermark: env_get("SKEIN_POOL_HIGH", DEFAULT_HIGH_WATERMARK),
            max_queue_size: env_get("SKEIN_POOL_QUEUE", DEFAULT_MAX_QUEUE_SIZE),
            idle_timeout: env_get_ms(
                "SKEIN_POOL_IDLE_MS",
                Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            ),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn low_watermark(mut self, n: usize) -> Self {
        self.low_watermark = n;
        self
    }

    pub fn high_watermark(mut self, n: usize) -> Self {
        self.high_watermark = n;
        self
    }

    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.high_watermark == 0 {
            return Err("high_watermark must be at least 1");
        }
        if self.low_watermark > self.high_watermark {
            return Err("low_watermark must not exceed high_watermark");
        }
        if self.max_queue_size == 0 {
            return Err("max_queue_size must be at least 1");
        }
        Ok(())
    }
}

/// Coroutine engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Usable stack bytes per task (rounded up to whole pages)
    pub stack_size: usize,

    /// Maximum live tasks
    pub max_tasks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile-time defaults with `SKEIN_STACK_SIZE` / `SKEIN_MAX_TASKS` applied
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("SKEIN_STACK_SIZE", DEFAULT_STACK_SIZE),
            max_tasks: env_get("SKEIN_MAX_TASKS", DEFAULT_MAX_TASKS),
        }
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn max_tasks(mut self, n: usize) -> Self {
        self.max_tasks = n;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err("stack_size below minimum");
        }
        if self.max_tasks == 0 {
            return Err("max_tasks must be at least 1");
        }
        if self.max_tasks > u32::MAX as usize {
            return Err("max_tasks exceeds id space");
        }
        Ok(())
    }
}
