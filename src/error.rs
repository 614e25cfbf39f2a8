//! Error types for tusk.

use std::time::Duration;

use thiserror::Error;

/// Main error type for tusk.
#[derive(Error, Debug)]
pub enum TuskError {
    #[error("PHP runtime not found: {0}")]
    RuntimeNotFound(String),

    #[error("Failed to spawn worker {id}: {source}")]
    Spawn {
        id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {id} closed its channel")]
    ChannelClosed { id: usize },

    #[error("Worker {id} protocol error: {message}")]
    Protocol { id: usize, message: String },

    #[error("Worker {id} did not respond within {after:?}")]
    Timeout { id: usize, after: Duration },

    #[error("Pool saturated: no idle worker within {0:?}")]
    PoolSaturated(Duration),

    #[error("no workers available")]
    NoWorkers,

    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TuskError {
    /// Whether this error means the worker that produced it can no longer be trusted.
    ///
    /// Channel, protocol and timeout failures leave the half-duplex stream in an
    /// unknown position, so the worker has to be killed and replaced.
    pub fn is_worker_fatal(&self) -> bool {
        matches!(
            self,
            Self::ChannelClosed { .. } | Self::Protocol { .. } | Self::Timeout { .. }
        )
    }
}

/// Result type alias for tusk operations.
pub type Result<T> = std::result::Result<T, TuskError>;
