//! crib-ai: streaming client for the Gemini generation API
//!
//! Each call is one request/response exchange. The client turns the SSE
//! response body into incremental text fragments followed by exactly one
//! terminal event per request.

pub mod error;
pub mod gemini;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use gemini::{DEFAULT_BASE_URL, GeminiClient};
pub use stream::{StreamEvent, StreamEventStream};
pub use types::{DEFAULT_TEMPERATURE, GenerateRequest, GenerationConfig, TokenUsage};
