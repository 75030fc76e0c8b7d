#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub use log;

#[cfg(feature = "free_log")]
pub use free_log_client;

#[cfg(feature = "free_log")]
mod free_log {
    use std::path::Path;

    use free_log_client::FreeLogLayer;
    use thiserror::Error;

    #[cfg(debug_assertions)]
    const DEFAULT_LOG_LEVEL: &str = "switchboard=trace";
    #[cfg(not(debug_assertions))]
    const DEFAULT_LOG_LEVEL: &str = "switchboard=info";

    #[derive(Debug, Error)]
    pub enum InitError {
        #[error(transparent)]
        Logs(#[from] free_log_client::LogsInitError),
        #[error(transparent)]
        BuildLogsConfig(#[from] free_log_client::BuildLogsConfigError),
        #[error(transparent)]
        BuildFileWriterConfig(#[from] free_log_client::BuildFileWriterConfigError),
    }

    /// Resolves the env filter: `SWITCHBOARD_LOG`, then `RUST_LOG`, then the build default.
    #[must_use]
    pub fn env_filter() -> String {
        std::env::var("SWITCHBOARD_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string())
    }

    /// Installs the global logger.
    ///
    /// When both `filename` and `log_dir` are given, debug level output is also
    /// written to `log_dir/filename`.
    ///
    /// # Errors
    ///
    /// * If the file writer config is invalid
    /// * If the logger fails to initialize
    pub fn init(filename: Option<&str>, log_dir: Option<&Path>) -> Result<FreeLogLayer, InitError> {
        let mut logs_config = free_log_client::LogsConfig::builder();

        match (filename, log_dir) {
            (Some(filename), Some(log_dir)) => {
                logs_config = logs_config.with_file_writer(
                    free_log_client::FileWriterConfig::builder()
                        .file_path(log_dir.join(filename))
                        .log_level(free_log_client::Level::Debug),
                )?;
            }
            (Some(filename), None) => {
                log::warn!("No log directory configured, not writing {filename}");
            }
            _ => {}
        }

        let layer = free_log_client::init(logs_config.env_filter(env_filter()))?;

        Ok(layer)
    }
}

#[cfg(feature = "free_log")]
pub use free_log::*;

/// Logs the first form at debug level, or the second, more detailed form when
/// trace is enabled.
#[cfg(feature = "macros")]
#[macro_export]
macro_rules! debug_or_trace {
    (($($debug:tt)+), ($($trace:tt)+)) => {
        if $crate::log::log_enabled!($crate::log::Level::Trace) {
            $crate::log::trace!($($trace)*);
        } else {
            $crate::log::debug!($($debug)*);
        }
    }
}
