//! Error taxonomy for the detection core.
//!
//! "Not enough history" is deliberately absent: it is an expected warm-up
//! state and is modelled as [`crate::analyzer::Evaluation::InsufficientData`].

use std::path::PathBuf;

/// A plugin configuration record that is missing a field or holds a bad value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid plugin name '{0}' (allowed: letters, digits, '_' and '-')")]
    InvalidPluginName(String),

    #[error("invalid metric name '{0}' (allowed: letters, digits, '_', '.' and '-')")]
    InvalidMetricName(String),

    #[error("plugin '{plugin}': metric '{metric}' has non-finite value {value}")]
    NonFiniteValue { plugin: String, metric: String, value: f64 },

    #[error("plugin '{plugin}': missing required key '{key}'")]
    MissingKey { plugin: String, key: &'static str },

    #[error("plugin '{plugin}': key '{key}' has value '{value}', expected {expected}")]
    Malformed {
        plugin: String,
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("plugin '{plugin}': unknown key '{key}'")]
    UnknownKey { plugin: String, key: String },

    #[error("plugin '{plugin}': {reason}")]
    Invariant { plugin: String, reason: String },
}

/// Durable read/write failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage: {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("storage: {op} {} timed out after {timeout_ms}ms", path.display())]
    Timeout {
        op: &'static str,
        path: PathBuf,
        timeout_ms: u64,
    },

    #[error("storage: corrupt record in {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage: TOML encode error: {0}")]
    Toml(#[from] toml::ser::Error),
}

/// Notification dispatch failures. These never touch debounce state.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport: channel '{channel}' failed: {reason}")]
    Channel { channel: String, reason: String },

    #[error("transport: all {attempted} channel(s) failed")]
    AllChannelsFailed { attempted: usize },

    #[error("transport: HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
