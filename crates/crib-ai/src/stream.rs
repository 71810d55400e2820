//! Streaming event types

use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

use crate::types::TokenUsage;

/// Events emitted while a generation request streams.
///
/// Chunks arrive in order; every stream ends with exactly one `Done` or
/// one `Error`, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text fragment
    Chunk { delta: String },
    /// Stream finished; carries the full concatenated text
    Done { text: String, usage: TokenUsage },
    /// Request failed; no further events follow
    Error { message: String },
}

impl StreamEvent {
    /// Check if this is a terminal event (Done or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    /// Get the full text if this is a Done event
    pub fn into_text(self) -> Option<String> {
        match self {
            StreamEvent::Done { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// A stream of generation events
pub type StreamEventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;
