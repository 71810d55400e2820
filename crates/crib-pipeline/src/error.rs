//! Error types for crib-pipeline

use thiserror::Error;

/// Result type alias using crib-pipeline Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// No API key configured; checked before any network call
    #[error("API Key has not been set.")]
    MissingApiKey,

    /// The extracted page text was empty
    #[error("No readable content was found on this page.")]
    NoContent,

    /// The tab already has a stage in flight
    #[error("Tab {0} already has an analysis in flight")]
    TabBusy(u32),

    /// No session exists for the tab
    #[error("No session for tab {0}")]
    NoSession(u32),

    /// Explanation requested before the answer stage completed
    #[error("Tab {0} has no completed answer to explain")]
    NotAnswered(u32),

    /// Storage I/O failed
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
