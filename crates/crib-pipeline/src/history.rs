//! Bounded, newest-first log of completed analyses

use serde::{Deserialize, Serialize};

use crate::answer::Confidence;
use crate::session::Session;

/// Maximum number of entries the log retains
pub const MAX_ENTRIES: usize = 100;

/// A snapshot of one completed analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Creation time in Unix milliseconds; unique, and the sort key
    pub id: i64,
    pub title: String,
    pub url: String,
    pub cleaned_content: String,
    pub answer: String,
    pub explanation: Option<String>,
    pub confidence: Option<Confidence>,
    /// RFC 3339 creation time
    pub timestamp: String,
}

impl HistoryEntry {
    /// Snapshot a session whose answer stage has completed.
    ///
    /// Returns `None` while the cleaned content or answer is missing.
    pub fn from_session(session: &Session) -> Option<Self> {
        let now = chrono::Utc::now();
        Some(Self {
            id: now.timestamp_millis(),
            title: session
                .page
                .as_ref()
                .map(|p| p.title.clone())
                .unwrap_or_default(),
            url: session
                .page
                .as_ref()
                .map(|p| p.url.clone())
                .unwrap_or_default(),
            cleaned_content: session.cleaned_content.clone()?,
            answer: session.answer.clone()?,
            explanation: session.explanation.clone(),
            confidence: session.confidence,
            timestamp: now.to_rfc3339(),
        })
    }
}

/// Bounded in-memory log, newest first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries, sorted newest first and re-capped
    pub fn from_entries(mut entries: Vec<HistoryEntry>) -> Self {
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        entries.truncate(MAX_ENTRIES);
        Self { entries }
    }

    /// Insert at the front, evicting the oldest entry when at capacity.
    ///
    /// Ids are creation-time millis; they are nudged forward when two
    /// completions land in the same millisecond so they stay strictly
    /// increasing. Returns the id actually recorded.
    pub fn append(&mut self, mut entry: HistoryEntry) -> i64 {
        if let Some(newest) = self.entries.first() {
            if entry.id <= newest.id {
                entry.id = newest.id + 1;
            }
        }
        let id = entry.id;
        self.entries.insert(0, entry);
        self.entries.truncate(MAX_ENTRIES);
        id
    }

    /// Attach an explanation to an existing entry; false when absent
    pub fn record_explanation(&mut self, id: i64, explanation: impl Into<String>) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.explanation = Some(explanation.into());
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
