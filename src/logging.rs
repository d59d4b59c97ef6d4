//! Tracing setup for the `danci-core` binary.
//!
//! Stdout always gets the formatted events. With `ENABLE_FILE_LOGS` a second,
//! ANSI-free copy goes to a daily rolling file under `LOG_DIR`.

use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "danci-core.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot create log directory {}: {source}", dir.display())]
    LogDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub filter: String,
    /// `Some` turns on the rolling file copy.
    pub file_dir: Option<PathBuf>,
}

impl LogSettings {
    pub fn from_env(filter: &str) -> Self {
        let file_logs = matches!(
            std::env::var("ENABLE_FILE_LOGS").ok().as_deref(),
            Some("true") | Some("1")
        );
        Self {
            filter: filter.to_string(),
            file_dir: file_logs.then(|| {
                std::env::var("LOG_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./logs"))
            }),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Keeps the non-blocking file writer alive; dropping it loses buffered lines.
pub struct FileLogGuard {
    _guard: WorkerGuard,
}

pub fn install(settings: &LogSettings) -> Result<Option<FileLogGuard>, LoggingError> {
    let (file_layer, guard) = match &settings.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::LogDir {
                dir: dir.clone(),
                source,
            })?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
            (Some(layer), Some(FileLogGuard { _guard: guard }))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(settings.env_filter())
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInstalled)?;
    Ok(guard)
}

/// Installs logging from the environment. Falls back to stdout only when the log
/// directory cannot be created.
pub fn init_tracing(filter: &str) -> Option<FileLogGuard> {
    let settings = LogSettings::from_env(filter);
    match install(&settings) {
        Ok(guard) => guard,
        Err(LoggingError::AlreadyInstalled) => None,
        Err(err) => {
            eprintln!("{err}; logging to stdout only");
            install(&LogSettings {
                file_dir: None,
                ..settings
            })
            .ok()
            .flatten()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwritable_log_dir_is_reported() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let settings = LogSettings {
            filter: "info".into(),
            file_dir: Some(file.path().join("logs")),
        };
        assert!(matches!(install(&settings), Err(LoggingError::LogDir { .. })));
    }
}
