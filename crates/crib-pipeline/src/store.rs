//! Injectable persistence for sessions and history

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::history::HistoryEntry;
use crate::session::Session;

/// Persistence backend for sessions and the history log.
///
/// Each call reads or writes one whole record, so a reload always sees
/// the last completed write.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_sessions(&self) -> Result<Vec<Session>>;
    async fn save_session(&self, session: &Session) -> Result<()>;
    async fn remove_session(&self, tab_id: u32) -> Result<()>;
    async fn load_history(&self) -> Result<Vec<HistoryEntry>>;
    async fn save_history(&self, entries: &[HistoryEntry]) -> Result<()>;
}

/// In-memory store for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<u32, Session>>,
    history: Mutex<Vec<HistoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.sessions.lock().values().cloned().collect())
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        self.sessions.lock().insert(session.tab_id, session.clone());
        Ok(())
    }

    async fn remove_session(&self, tab_id: u32) -> Result<()> {
        self.sessions.lock().remove(&tab_id);
        Ok(())
    }

    async fn load_history(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.history.lock().clone())
    }

    async fn save_history(&self, entries: &[HistoryEntry]) -> Result<()> {
        *self.history.lock() = entries.to_vec();
        Ok(())
    }
}

/// On-disk store: one JSON file per tab plus a history blob
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    /// Default data directory (`~/.local/share/crib` on Linux)
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("crib")
    }

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn session_path(&self, tab_id: u32) -> PathBuf {
        self.dir.join(format!("tab-{}.json", tab_id))
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join("history.json")
    }
}

#[async_trait]
impl StateStore for JsonStore {
    async fn load_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("tab-") || !name.ends_with(".json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<Session>(&content) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!("skipping unreadable session file {}: {}", path.display(), e);
                }
            }
        }
        Ok(sessions)
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_string_pretty(session)?;
        tokio::fs::write(self.session_path(session.tab_id), content).await?;
        Ok(())
    }

    async fn remove_session(&self, tab_id: u32) -> Result<()> {
        match tokio::fs::remove_file(self.session_path(tab_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_history(&self) -> Result<Vec<HistoryEntry>> {
        match tokio::fs::read_to_string(self.history_path()).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_history(&self, entries: &[HistoryEntry]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(self.history_path(), content).await?;
        Ok(())
    }
}
