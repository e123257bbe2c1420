//! Error types for memgate orchestration.
//!
//! Per-unit build and verification failures are *outcomes*, not errors; they
//! are recorded in the report. `MemgateError` covers the infrastructure
//! problems that stop a run outright.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemgateError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Empty command line for {0}")]
    EmptyCommand(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl MemgateError {
    /// Attach a path to an `std::io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MemgateError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for memgate operations
pub type Result<T> = std::result::Result<T, MemgateError>;
