//! Error types for crib-ai

use thiserror::Error;

/// Result type alias using crib-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to the generation endpoint
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The endpoint returned a non-2xx status
    #[error("{message}")]
    Api { status: u16, message: String },

    /// Invalid or missing API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// The stream finished without producing any text
    #[error("Model returned an empty response.")]
    EmptyResponse,

    /// The model replied with something the caller cannot use
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl Error {
    /// Create an API error from an HTTP status and a provider message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// API error for a status whose body carried no usable message
    pub fn status(status: u16) -> Self {
        Self::Api {
            status,
            message: format!("Request failed with status {}", status),
        }
    }
}
