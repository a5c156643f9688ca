//! Runtime Configuration
//!
//! This module provides configuration for the metadata runtime.
//! Configuration can be set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `METADATA_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `METADATA_PAGE_SIZE` | Arena page size in bytes (power of two) | 16384 (16KB) |
//! | `METADATA_MAX_POOL_ALLOCATION` | Largest request served from the arena pool | page size / 2 |
//! | `METADATA_FATAL_POLICY` | What a fatal error does ("abort"/"panic") | abort |
//! | `METADATA_MAX_DIAGNOSTIC_BYTES` | Truncation limit for cycle diagnostics | 131072 (128KB) |
//! | `METADATA_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `METADATA_LOG_TIMESTAMPS` | Include timestamps in log output ("true"/"false") | true |
//!
//! # Example
//!
//! ```rust,ignore
//! use metadata_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .page_size(64 * 1024)
//!     .fatal_policy(FatalPolicy::Panic)
//!     .build()?;
//! ```

use std::env;

pub use crate::fatal::FatalPolicy;

/// Default arena page size.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Smallest page size the arena accepts.
pub const MIN_PAGE_SIZE: usize = 4096;

/// Largest page size the arena accepts.
pub const MAX_PAGE_SIZE: usize = 1 << 30;

/// Default truncation limit for fatal diagnostics.
pub const DEFAULT_MAX_DIAGNOSTIC_BYTES: usize = 128 * 1024;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Allocation arena configuration.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Size of each pool page in bytes. Must be a power of two.
    /// Default: 16KB.
    pub page_size: usize,

    /// Requests larger than this bypass the pool and go to the heap.
    /// Default: half a page.
    pub max_pool_allocation: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pool_allocation: DEFAULT_PAGE_SIZE / 2,
        }
    }
}

/// Fatal diagnostics configuration.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// What happens after a fatal error has been reported.
    /// Default: abort the process.
    pub fatal_policy: FatalPolicy,

    /// Cycle diagnostics are truncated to this many bytes.
    /// Default: 128KB.
    pub max_diagnostic_bytes: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            fatal_policy: FatalPolicy::Abort,
            max_diagnostic_bytes: DEFAULT_MAX_DIAGNOSTIC_BYTES,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Include timestamps in log output.
    /// Default: true.
    pub timestamps: bool,

    /// Include thread names in log output.
    /// Default: false.
    pub thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamps: true,
            thread_names: false,
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Arena configuration.
    pub arena: ArenaConfig,

    /// Fatal diagnostics configuration.
    pub diagnostics: DiagnosticsConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set, or that hold unusable values, leave the
    /// default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Arena configuration
        if let Some(val) = parse_env_usize("METADATA_PAGE_SIZE") {
            if val.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&val) {
                config.arena.page_size = val;
                config.arena.max_pool_allocation = val / 2;
            }
        }

        if let Some(val) = parse_env_usize("METADATA_MAX_POOL_ALLOCATION") {
            if val > 0 && val <= config.arena.page_size {
                config.arena.max_pool_allocation = val;
            }
        }

        // Diagnostics configuration
        if let Ok(val) = env::var("METADATA_FATAL_POLICY") {
            if let Some(policy) = FatalPolicy::parse(&val) {
                config.diagnostics.fatal_policy = policy;
            }
        }

        if let Some(val) = parse_env_usize("METADATA_MAX_DIAGNOSTIC_BYTES") {
            if val > 0 {
                config.diagnostics.max_diagnostic_bytes = val;
            }
        }

        // Logging configuration
        if let Ok(val) = env::var("METADATA_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        if let Some(val) = parse_env_bool("METADATA_LOG_TIMESTAMPS") {
            config.log.timestamps = val;
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let page_size = self.arena.page_size;
        if !page_size.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                field: "arena.page_size".into(),
                message: "must be a power of two".into(),
            });
        }

        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(ConfigError::InvalidValue {
                field: "arena.page_size".into(),
                message: format!("must be between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE} bytes"),
            });
        }

        if self.arena.max_pool_allocation == 0 || self.arena.max_pool_allocation > page_size {
            return Err(ConfigError::InvalidValue {
                field: "arena.max_pool_allocation".into(),
                message: "must be between 1 and page_size".into(),
            });
        }

        if self.diagnostics.max_diagnostic_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "diagnostics.max_diagnostic_bytes".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the arena page size in bytes.
    ///
    /// The pool threshold follows at half a page unless set explicitly afterwards.
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.arena.page_size = size;
        self.config.arena.max_pool_allocation = size / 2;
        self
    }

    /// Set the largest request served from the arena pool.
    pub fn max_pool_allocation(mut self, size: usize) -> Self {
        self.config.arena.max_pool_allocation = size;
        self
    }

    /// Set the fatal error policy.
    pub fn fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.config.diagnostics.fatal_policy = policy;
        self
    }

    /// Set the truncation limit for fatal diagnostics.
    pub fn max_diagnostic_bytes(mut self, bytes: usize) -> Self {
        self.config.diagnostics.max_diagnostic_bytes = bytes;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Enable or disable timestamps in log output.
    pub fn log_timestamps(mut self, enabled: bool) -> Self {
        self.config.log.timestamps = enabled;
        self
    }

    /// Enable or disable thread names in log output.
    pub fn log_thread_names(mut self, enabled: bool) -> Self {
        self.config.log.thread_names = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// The arena clamps unusable page sizes on its own, so an unchecked
    /// configuration never produces undefined behavior.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.arena.page_size, 16 * 1024);
        assert_eq!(config.arena.max_pool_allocation, 8 * 1024);
        assert_eq!(config.diagnostics.fatal_policy, FatalPolicy::Abort);
        assert_eq!(config.diagnostics.max_diagnostic_bytes, 128 * 1024);
        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .page_size(64 * 1024)
            .fatal_policy(FatalPolicy::Panic)
            .log_level(LogLevel::Debug)
            .build()
            .unwrap();

        assert_eq!(config.arena.page_size, 64 * 1024);
        assert_eq!(config.arena.max_pool_allocation, 32 * 1024);
        assert_eq!(config.diagnostics.fatal_policy, FatalPolicy::Panic);
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn test_builder_validation() {
        assert!(RuntimeConfig::builder().page_size(10_000).build().is_err());
        assert!(RuntimeConfig::builder().page_size(1024).build().is_err());
        assert!(
            RuntimeConfig::builder()
                .max_pool_allocation(64 * 1024)
                .build()
                .is_err()
        );
        assert!(RuntimeConfig::builder().max_diagnostic_bytes(0).build().is_err());
    }

    #[test]
    fn test_build_unchecked_skips_validation() {
        let config = RuntimeConfig::builder().page_size(3).build_unchecked();
        assert_eq!(config.arena.page_size, 3);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("invalid"), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "arena.page_size".into(),
            message: "must be a power of two".into(),
        };
        assert!(err.to_string().contains("arena.page_size"));
        assert!(err.to_string().contains("must be a power of two"));
    }

    #[test]
    fn test_from_env() {
        // SAFETY: no other test in this binary touches METADATA_* variables.
        unsafe {
            env::set_var("METADATA_PAGE_SIZE", "65536");
            env::set_var("METADATA_FATAL_POLICY", "panic");
            env::set_var("METADATA_MAX_DIAGNOSTIC_BYTES", "not-a-number");
        }

        let config = RuntimeConfig::from_env();
        assert_eq!(config.arena.page_size, 65536);
        assert_eq!(config.arena.max_pool_allocation, 32768);
        assert_eq!(config.diagnostics.fatal_policy, FatalPolicy::Panic);
        assert_eq!(config.diagnostics.max_diagnostic_bytes, DEFAULT_MAX_DIAGNOSTIC_BYTES);

        unsafe {
            env::set_var("METADATA_PAGE_SIZE", "12345");
        }
        let config = RuntimeConfig::from_env();
        assert_eq!(config.arena.page_size, DEFAULT_PAGE_SIZE);

        unsafe {
            env::remove_var("METADATA_PAGE_SIZE");
            env::remove_var("METADATA_FATAL_POLICY");
            env::remove_var("METADATA_MAX_DIAGNOSTIC_BYTES");
        }
    }
}
