//! Error types shared across busfeed crates

use thiserror::Error;

/// Result type alias for busfeed operations
pub type Result<T> = std::result::Result<T, BusfeedError>;

/// Top-level error for failures that abort a run
#[derive(Error, Debug)]
pub enum BusfeedError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BusfeedError {
    /// Whether the error was raised before any record was processed
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            BusfeedError::SourceNotFound(_) | BusfeedError::SourceUnreadable(_)
        )
    }
}
