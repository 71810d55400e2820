//! crib-pipeline: per-tab analysis sessions and the stage pipeline
//!
//! This crate owns the session state machine, the clean -> answer ->
//! explain orchestration, the bounded history log, and the persistence
//! seam behind them. State transitions are pure; the pipeline applies
//! them, persists the result, and then notifies subscribers.

pub mod answer;
pub mod error;
pub mod events;
pub mod generator;
pub mod history;
pub mod pipeline;
pub mod prompts;
pub mod session;
pub mod store;

pub use answer::{Confidence, ParsedAnswer, parse_answer};
pub use error::{Error, Result};
pub use events::PipelineEvent;
pub use generator::{GeminiGenerator, TextGenerator};
pub use history::{HistoryEntry, HistoryLog, MAX_ENTRIES};
pub use pipeline::{DEFAULT_MAX_SOURCE_CHARS, DEFAULT_MODEL, Pipeline, PipelineConfig};
pub use prompts::{PromptOverrides, Tone};
pub use session::{PageInfo, Session, SessionEvent, Stage, Status};
pub use store::{JsonStore, MemoryStore, StateStore};
