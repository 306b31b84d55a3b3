//! Logging setup: stderr plus optional daily-rotated file output

use crate::config::LoggingConfig;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive used when RUST_LOG is unset
    pub default_directive: String,

    /// Log to file
    pub file_path: Option<PathBuf>,

    /// Log to stderr
    pub stderr: bool,

    /// JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            file_path: None,
            stderr: true,
            json: false,
        }
    }
}

impl From<&LoggingConfig> for LogConfig {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            default_directive: config.level.clone(),
            file_path: config.file.clone(),
            stderr: true,
            json: config.json,
        }
    }
}

impl LogConfig {
    /// Force debug output regardless of RUST_LOG
    pub fn debug(mut self) -> Self {
        self.default_directive = "debug".to_string();
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_directive.as_str()))
    }
}

/// Initialize logging with the given configuration
///
/// Returns the file writer guard when file logging is active; keep it alive
/// for the lifetime of the process or buffered lines are lost.
pub fn init_logging(
    config: LogConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = config.env_filter();

    let stderr_layer = config.stderr.then(|| {
        let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
        if config.json {
            layer.json().boxed()
        } else {
            layer.compact().boxed()
        }
    });

    let (file_layer, guard) = match &config.file_path {
        Some(file_path) => {
            let directory = file_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            std::fs::create_dir_all(directory)?;

            let file_name = file_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("bgh-sync.log"));
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            let layer = if config.json {
                layer.json().boxed()
            } else {
                layer.boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_logging_config() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            file: Some(PathBuf::from("/tmp/bgh.log")),
            json: true,
        };
        let log_config = LogConfig::from(&config);
        assert_eq!(log_config.default_directive, "warn");
        assert!(log_config.json);
        assert!(log_config.stderr);
        assert_eq!(log_config.debug().default_directive, "debug");
    }
}
