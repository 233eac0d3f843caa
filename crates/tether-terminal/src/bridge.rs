/// Process bridge abstraction over tmux-backed and plain PTY processes
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use tether_types::model::is_valid_id;
use tether_types::{Result, TetherError};

use super::plain_bridge::PlainBridge;
use super::tmux_bridge::TmuxBridge;

/// Result of an idempotent create-or-attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerSession {
    pub name: String,
    /// False when the session already existed.
    pub created: bool,
}

/// Handle to one OS process running behind a PTY
///
/// Exclusively owned by a single `Terminal`. Methods take `&self` and must not
/// block on each other: a write stuck on a full PTY cannot delay `kill`.
pub trait ProcessHandle: Send + Sync {
    /// Queue raw input bytes for the process.
    fn write(&self, data: &[u8]) -> Result<()>;

    fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    fn kill(&self) -> Result<()>;
}

/// A freshly spawned process plus its output and exit channels
///
/// `output` closes once the PTY reaches EOF; `exit` resolves with the exit
/// code (when the platform reports one) after that.
pub struct SpawnedProcess {
    pub handle: Box<dyn ProcessHandle>,
    pub output: mpsc::Receiver<Bytes>,
    pub exit: oneshot::Receiver<Option<u32>>,
}

/// Bridge between terminal ids and long-lived OS processes
#[async_trait]
pub trait ProcessBridge: Send + Sync {
    /// Create the named detached session, or attach to it if it already exists.
    async fn ensure_session(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        cwd: Option<&Path>,
    ) -> Result<MultiplexerSession>;

    async fn session_exists(&self, name: &str) -> Result<bool>;

    /// Spawn a PTY process attached to the named session.
    async fn spawn_attached(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        cwd: Option<&Path>,
    ) -> Result<SpawnedProcess>;

    /// Full history of the session, escape sequences preserved.
    /// Errors with `NotFound` when the session does not exist.
    async fn capture_scrollback(&self, name: &str) -> Result<Bytes>;

    /// Best effort. A session that is already gone is not an error.
    async fn destroy_session(&self, name: &str) -> Result<()>;

    /// True when terminals cannot outlive their process.
    fn is_degraded(&self) -> bool;

    /// Get backend name for debugging
    fn backend_name(&self) -> &str;
}

/// Configuration for which backend to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// tmux-backed sessions that survive server restarts (default)
    #[default]
    Tmux,
    /// Plain shells, no persistence
    Plain,
}

impl std::str::FromStr for BackendType {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tmux" => Ok(Self::Tmux),
            "plain" | "pty" => Ok(Self::Plain),
            _ => Err(TetherError::invalid(format!(
                "Invalid terminal backend: '{}'. Valid options: 'tmux', 'plain'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tmux => write!(f, "tmux"),
            Self::Plain => write!(f, "plain"),
        }
    }
}

/// Settings shared by both bridge implementations
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub backend: BackendType,
    pub tmux_binary: String,
    /// Private tmux server socket (`tmux -L`). `None` uses the user's default server.
    pub tmux_socket: Option<String>,
    pub history_limit: u32,
    /// Shell to run; falls back to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
    /// Upper bound on each tmux invocation.
    pub timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Tmux,
            tmux_binary: "tmux".to_string(),
            tmux_socket: Some("tether".to_string()),
            history_limit: 50_000,
            shell: None,
            timeout: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    pub fn shell_path(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Reject ids that could make two terminals share a multiplexer session.
///
/// Terminal ids are limited to `[A-Za-z0-9_-]`. Session ids additionally may
/// not contain `_`, which separates the two parts of the name, so the
/// mapping in [`multiplexer_name`] stays one-to-one.
pub fn check_multiplexer_ids(session_id: &str, terminal_id: &str) -> Result<()> {
    if !is_valid_id(session_id) || session_id.contains('_') {
        return Err(TetherError::invalid(format!(
            "invalid session id: {:?}",
            session_id
        )));
    }
    if !is_valid_id(terminal_id) {
        return Err(TetherError::invalid(format!(
            "invalid terminal id: {:?}",
            terminal_id
        )));
    }
    Ok(())
}

/// Deterministic multiplexer session name for a terminal.
///
/// Characters tmux treats specially in targets (`.`, `:` and friends) are
/// replaced so the name is always a valid exact-match target. Only ids that
/// pass [`check_multiplexer_ids`] are guaranteed a name of their own.
pub fn multiplexer_name(session_id: &str, terminal_id: &str) -> String {
    let raw = format!("tether_{}_{}", session_id, terminal_id);
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build the configured bridge, falling back to plain shells when tmux is missing.
pub async fn detect_bridge(config: BridgeConfig) -> Arc<dyn ProcessBridge> {
    match config.backend {
        BackendType::Plain => {
            info!("Terminal backend: plain (configured)");
            Arc::new(PlainBridge::new(config))
        }
        BackendType::Tmux => match TmuxBridge::detect(&config).await {
            Ok(version) => {
                info!(version = %version.trim(), "Terminal backend: tmux");
                Arc::new(TmuxBridge::new(config))
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "tmux unavailable, degraded mode: terminals will not survive a restart"
                );
                Arc::new(PlainBridge::new(config))
            }
        },
    }
}

/// Working directory to hand to a spawned process.
pub(crate) fn resolve_cwd(cwd: Option<&Path>) -> Option<PathBuf> {
    cwd.filter(|p| p.is_dir()).map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplexer_name_is_deterministic() {
        let a = multiplexer_name("s1", "t1");
        let b = multiplexer_name("s1", "t1");
        assert_eq!(a, b);
        assert_eq!(a, "tether_s1_t1");
    }

    #[test]
    fn test_multiplexer_name_replaces_target_separators() {
        let name = multiplexer_name("my.session", "a:b/c");
        assert_eq!(name, "tether_my_session_a_b_c");
    }

    #[test]
    fn test_multiplexer_name_keeps_uuid_shape() {
        let name = multiplexer_name(
            "0b7e5f1e-2d7b-4f0c-9f55-4c1c0f2c9a11",
            "c0ffee00-0000-4000-8000-000000000001",
        );
        assert!(name.starts_with("tether_0b7e5f1e-2d7b"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn test_check_multiplexer_ids() {
        let session = "0b7e5f1e-2d7b-4f0c-9f55-4c1c0f2c9a11";
        assert!(check_multiplexer_ids(session, "client_id-1").is_ok());
        assert!(check_multiplexer_ids("s1", "a.b").is_err());
        assert!(check_multiplexer_ids("s1", "").is_err());
        assert!(check_multiplexer_ids("s1_a", "b").is_err());
        assert!(check_multiplexer_ids("s:1", "t1").is_err());
    }

    #[test]
    fn test_backend_type_parse() {
        assert_eq!("tmux".parse::<BackendType>().unwrap(), BackendType::Tmux);
        assert_eq!("PLAIN".parse::<BackendType>().unwrap(), BackendType::Plain);
        assert_eq!("pty".parse::<BackendType>().unwrap(), BackendType::Plain);
        assert!("screen".parse::<BackendType>().is_err());
        assert_eq!(BackendType::default().to_string(), "tmux");
    }
}
