//! Error types for multiquota.

use thiserror::Error;

/// Main error type for multiquota operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Invalid bucket, limiter or clock configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lookup of a bucket name the limiter does not know
    #[error("Unknown bucket: {0}")]
    UnknownBucket(String),

    /// A rate-limited action was refused
    #[error("Exhausted quota: {}", .exhausted.join(", "))]
    QuotaExceeded {
        /// Names of the buckets that lacked tokens, in declaration order
        exhausted: Vec<String>,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QuotaError {
    /// The exhausted bucket names if this is a quota refusal.
    pub fn exhausted(&self) -> Option<&[String]> {
        match self {
            QuotaError::QuotaExceeded { exhausted } => Some(exhausted),
            _ => None,
        }
    }
}

/// Result type alias for multiquota operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
