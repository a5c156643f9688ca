//! Logging setup.
//!
//! The runtime emits structured events through `tracing`. Embedders that
//! already install a subscriber need nothing from this module; everyone else
//! can call [`init`] once with the configured [`LogConfig`].
//!
//! `RUST_LOG` takes precedence over the configured level when it is set.

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

/// Filter directive for a configured level.
pub fn filter_directive(level: LogLevel) -> String {
    format!("metadata_runtime={}", level.as_str())
}

/// Install a global fmt subscriber for the runtime.
///
/// Returns `false` if a global subscriber was already installed, in which case
/// the existing one keeps receiving events.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(config.thread_names);

    if config.timestamps {
        builder.try_init().is_ok()
    } else {
        builder.without_time().try_init().is_ok()
    }
}
