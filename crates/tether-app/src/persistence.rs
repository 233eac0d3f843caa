//! JSON-file persistence adapter
//!
//! One pretty-printed JSON file per row:
//! `<data_dir>/sessions/<id>.json` and `<data_dir>/terminals/<id>.json`.
//! Writes go to a temp file first and are renamed into place, so a crash
//! never leaves a half-written row behind.

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use tether_types::model::is_valid_id;
use tether_types::{Layout, Result, Session, SessionStore, TerminalRecord, TetherError};

pub struct JsonFileStore {
    sessions_dir: PathBuf,
    terminals_dir: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `data_dir`.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let sessions_dir = data_dir.join("sessions");
        let terminals_dir = data_dir.join("terminals");
        fs::create_dir_all(&sessions_dir).await?;
        fs::create_dir_all(&terminals_dir).await?;
        Ok(Self {
            sessions_dir,
            terminals_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn session_path(&self, id: &str) -> Option<PathBuf> {
        row_path(&self.sessions_dir, id)
    }

    fn terminal_path(&self, id: &str) -> Option<PathBuf> {
        row_path(&self.terminals_dir, id)
    }

    async fn load_session(&self, id: &str) -> Result<Option<Session>> {
        match self.session_path(id) {
            Some(path) => read_row(&path).await,
            None => Ok(None),
        }
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        let path = self
            .session_path(&session.id)
            .ok_or_else(|| TetherError::invalid(format!("invalid session id: {}", session.id)))?;
        write_row(&path, session).await
    }
}

fn row_path(dir: &Path, id: &str) -> Option<PathBuf> {
    is_valid_id(id).then(|| dir.join(format!("{}.json", id)))
}

async fn read_row<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_row<T: Serialize>(path: &Path, row: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(row)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_row(path: Option<PathBuf>) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Every parseable row in `dir`. Unreadable files are logged and skipped.
async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut rows = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match read_row::<T>(&path).await {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable row"),
        }
    }
    Ok(rows)
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn create_session(&self, session: &Session) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.save_session(session).await
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<Session>> {
        self.load_session(session_id).await
    }

    async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let sessions: Vec<Session> = read_all(&self.sessions_dir).await?;
        Ok(sessions
            .into_iter()
            .filter(|s| s.owner_user_id == user_id)
            .collect())
    }

    async fn update_layout(&self, session_id: &str, layout: &Layout) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut session = self
            .load_session(session_id)
            .await?
            .ok_or_else(|| TetherError::session_not_found(session_id))?;
        session.layout = layout.clone();
        self.save_session(&session).await
    }

    async fn rename_session(&self, session_id: &str, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut session) = self.load_session(session_id).await? else {
            return Ok(false);
        };
        session.name = name.to_string();
        self.save_session(&session).await?;
        Ok(true)
    }

    async fn touch_session(&self, session_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(mut session) = self.load_session(session_id).await? {
            session.last_accessed = Utc::now();
            self.save_session(&session).await?;
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        remove_row(self.session_path(session_id)).await
    }

    async fn create_terminal_record(&self, record: &TerminalRecord) -> Result<()> {
        let path = self
            .terminal_path(&record.id)
            .ok_or_else(|| TetherError::invalid(format!("invalid terminal id: {}", record.id)))?;
        let _guard = self.write_lock.lock().await;
        write_row(&path, record).await
    }

    async fn find_terminal_record(&self, terminal_id: &str) -> Result<Option<TerminalRecord>> {
        match self.terminal_path(terminal_id) {
            Some(path) => read_row(&path).await,
            None => Ok(None),
        }
    }

    async fn list_terminal_records(&self, session_id: &str) -> Result<Vec<TerminalRecord>> {
        let records: Vec<TerminalRecord> = read_all(&self.terminals_dir).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.session_id == session_id)
            .collect())
    }

    async fn delete_terminal_record(&self, terminal_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        remove_row(self.terminal_path(terminal_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_path_rejects_path_tricks() {
        let dir = Path::new("/data/sessions");
        assert_eq!(
            row_path(dir, "client_id-1"),
            Some(PathBuf::from("/data/sessions/client_id-1.json"))
        );
        assert!(row_path(dir, "").is_none());
        assert!(row_path(dir, "../etc/passwd").is_none());
        assert!(row_path(dir, "a/b").is_none());
        assert!(row_path(dir, &"x".repeat(200)).is_none());
    }
}
