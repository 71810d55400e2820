//! Per-tab session state and the pure transition function

use serde::{Deserialize, Serialize};

use crate::answer::{Confidence, parse_answer};

/// One request/response unit of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Clean,
    Answer,
    Explain,
}

impl Stage {
    /// Lowercase wire/display name
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Clean => "clean",
            Stage::Answer => "answer",
            Stage::Explain => "explain",
        }
    }
}

/// Where a session currently is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Idle,
    Loading,
    Cleaning,
    Answering,
    Complete,
    Explaining,
    Error,
}

impl Status {
    /// Lowercase wire/display name
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Loading => "loading",
            Status::Cleaning => "cleaning",
            Status::Answering => "answering",
            Status::Complete => "complete",
            Status::Explaining => "explaining",
            Status::Error => "error",
        }
    }
}

/// Provenance of the page a session was extracted from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub title: String,
    pub url: String,
}

/// Events that drive a session's transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Extracted text delivered; no request dispatched yet
    Started,
    /// A stage's request went out
    StageStarted { stage: Stage },
    /// A stage's terminal event reported success
    StageCompleted { stage: Stage, text: String },
    /// A stage's terminal event reported failure
    Failed { stage: Stage, message: String },
    /// A history entry was appended for this session
    HistoryRecorded { id: i64 },
}

/// Per-tab record tracking pipeline progress and accumulated results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Owning browser tab; the primary key
    pub tab_id: u32,
    /// Monotonic per tab; events from older runs are discarded
    pub generation: u64,
    pub status: Status,
    /// Raw extracted input, set once when the session is created
    pub source_text: String,
    pub cleaned_content: Option<String>,
    pub answer: Option<String>,
    pub explanation: Option<String>,
    pub error: Option<String>,
    /// Parsed from the answer text; absent when the format does not match
    pub confidence: Option<Confidence>,
    pub reason: Option<String>,
    pub page: Option<PageInfo>,
    /// History entry recorded for this run, if any
    pub history_id: Option<i64>,
}

impl Session {
    /// Create a fresh idle session for a new analysis run
    pub fn new(
        tab_id: u32,
        generation: u64,
        source_text: impl Into<String>,
        page: Option<PageInfo>,
    ) -> Self {
        Self {
            tab_id,
            generation,
            status: Status::Idle,
            source_text: source_text.into(),
            cleaned_content: None,
            answer: None,
            explanation: None,
            error: None,
            confidence: None,
            reason: None,
            page,
            history_id: None,
        }
    }

    /// Whether a stage is currently in flight
    pub fn is_busy(&self) -> bool {
        matches!(
            self.status,
            Status::Loading | Status::Cleaning | Status::Answering | Status::Explaining
        )
    }

    /// Apply an event, returning the next state.
    ///
    /// Pure: persistence and notification are the caller's side effects,
    /// applied after the transition. An event that does not match the
    /// current status leaves the session unchanged.
    pub fn apply(mut self, event: SessionEvent) -> Session {
        match (self.status, event) {
            (Status::Idle, SessionEvent::Started) => {
                self.status = Status::Loading;
            }
            (
                Status::Loading,
                SessionEvent::StageStarted {
                    stage: Stage::Clean,
                },
            ) => {
                self.status = Status::Cleaning;
            }
            (
                Status::Cleaning,
                SessionEvent::StageCompleted {
                    stage: Stage::Clean,
                    text,
                },
            ) => {
                self.cleaned_content = Some(text);
                self.status = Status::Answering;
            }
            (
                Status::Answering,
                SessionEvent::StageCompleted {
                    stage: Stage::Answer,
                    text,
                },
            ) => {
                let parsed = parse_answer(&text);
                self.confidence = parsed.confidence;
                self.reason = parsed.reason;
                self.answer = Some(text);
                self.status = Status::Complete;
            }
            (
                Status::Complete,
                SessionEvent::StageStarted {
                    stage: Stage::Explain,
                },
            ) => {
                self.status = Status::Explaining;
            }
            (
                Status::Explaining,
                SessionEvent::StageCompleted {
                    stage: Stage::Explain,
                    text,
                },
            ) => {
                self.explanation = Some(text);
                self.status = Status::Complete;
            }
            (
                Status::Loading | Status::Cleaning | Status::Answering | Status::Explaining,
                SessionEvent::Failed { stage, message },
            ) => {
                tracing::debug!(
                    tab_id = self.tab_id,
                    stage = stage.as_str(),
                    "stage failed: {}",
                    message
                );
                self.error = Some(message);
                self.status = Status::Error;
            }
            (Status::Complete, SessionEvent::HistoryRecorded { id }) => {
                self.history_id = Some(id);
            }
            (status, event) => {
                tracing::warn!(
                    tab_id = self.tab_id,
                    status = status.as_str(),
                    event = ?event,
                    "ignoring event that does not match session status"
                );
            }
        }
        self
    }
}
