//! Driver error types.

use crate::config::ConfigError;
use smtrace_core::CoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Driver errors.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("missing input: {0}")]
    MissingInput(&'static str),
}

impl DriverError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DriverError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns a stable error code suitable for exit reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            DriverError::Io { .. } => "IO_ERROR",
            DriverError::Core(e) => e.error_code(),
            DriverError::Json(_) => "BAD_INPUT",
            DriverError::Config(_) => "BAD_CONFIG",
            DriverError::Parse { .. } => "BAD_INPUT",
            DriverError::MissingInput(_) => "BAD_CONFIG",
        }
    }
}
