//! Logging bootstrap for bbfs binaries: console output always, optional
//! rolling file output.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error).  Overridden by
    /// `RUST_LOG` when set.
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for rolling log files; console-only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Prefix for log file names.
    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    /// Log rotation: "hourly", "daily", or "never".
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "bbfsd".into()
}

fn default_rotation() -> String {
    "daily".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: default_rotation(),
        }
    }
}

/// Install the global subscriber.  Call once at startup; when file logging
/// is enabled the returned guard must stay alive for the process lifetime
/// so the non-blocking writer flushes.
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match &config.log_dir {
        Some(dir) => {
            let rotation = match config.rotation.as_str() {
                "hourly" => rolling::Rotation::HOURLY,
                "never" => rolling::Rotation::NEVER,
                _ => rolling::Rotation::DAILY,
            };
            let appender = rolling::RollingFileAppender::builder()
                .rotation(rotation)
                .filename_prefix(config.file_prefix.clone())
                .filename_suffix("log")
                .build(dir)
                .expect("failed to create rolling log appender");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
            None
        }
    }
}
