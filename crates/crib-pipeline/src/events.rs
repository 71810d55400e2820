//! Events broadcast to pipeline observers

use serde::{Deserialize, Serialize};

use crate::session::{Session, Stage};

/// What subscribers see while the pipeline runs.
///
/// A `StateUpdate` is sent after every committed transition; the stream
/// events mirror the underlying generation request for the tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A session transition was committed and persisted
    StateUpdate { session: Session },
    /// An incremental text fragment arrived for an in-flight stage
    StreamChunk {
        tab_id: u32,
        request_type: Stage,
        text: String,
    },
    /// A stage's stream finished; carries the full text
    StreamEnd {
        tab_id: u32,
        request_type: Stage,
        text: String,
    },
    /// A stage's stream failed
    StreamError {
        tab_id: u32,
        request_type: Stage,
        message: String,
    },
}

impl PipelineEvent {
    /// Check if this event ends a stage's stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::StreamEnd { .. } | PipelineEvent::StreamError { .. }
        )
    }
}
