//! Logging configuration and initialization

use crate::config::LoggingConfig;
use crate::error::{ProcessingError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "image-pipeline.log";

/// Initialize console logging at `info`, honouring `RUST_LOG`
pub fn init_logging() -> Result<()> {
    init_logging_with(&LoggingConfig::default()).map(|_| ())
}

/// Initialize logging from configuration.
///
/// When `output_type` is `file` a daily-rolling file layer is added; the
/// returned guard flushes it on drop and must outlive the program's logging.
pub fn init_logging_with(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match (config.output_type.as_str(), &config.output_path) {
        ("file", Some(dir)) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
    {
        Ok(()) => Ok(guard),
        Err(e) => {
            let error_msg = e.to_string();
            if error_msg.contains("a global default trace dispatcher has already been set") {
                Ok(guard)
            } else {
                Err(ProcessingError::LoggingError {
                    message: format!("Failed to initialize logging: {}", e),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_init_is_repeatable() {
        let _ = init_logging();
        assert!(init_logging().is_ok());
    }

    #[test]
    fn test_file_logging_returns_guard() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            level: "debug".to_string(),
            output_type: "file".to_string(),
            output_path: Some(temp_dir.path().to_path_buf()),
        };

        let guard = init_logging_with(&config).unwrap();
        assert!(guard.is_some());
    }
}
