/// Tmux-backed process bridge
use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::CommandBuilder;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use tether_types::{Result, TetherError};

use super::bridge::{
    resolve_cwd, BridgeConfig, MultiplexerSession, ProcessBridge, SpawnedProcess,
};
use super::pty;

/// stderr fragments tmux prints when the server is racing a start or exit.
const TRANSIENT_ERRORS: &[&str] = &[
    "server exited unexpectedly",
    "lost server",
    "resource temporarily unavailable",
];

/// stderr fragments meaning the target session (or the whole server) is gone.
const MISSING_SESSION_ERRORS: &[&str] = &[
    "can't find session",
    "session not found",
    "no server running",
    "error connecting to",
];

const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Captured result of one tmux invocation
struct TmuxOutput {
    success: bool,
    stdout: Vec<u8>,
    stderr: String,
}

impl TmuxOutput {
    fn session_missing(&self) -> bool {
        let stderr = self.stderr.to_lowercase();
        MISSING_SESSION_ERRORS.iter().any(|m| stderr.contains(m))
    }

    fn is_transient(&self) -> bool {
        let stderr = self.stderr.to_lowercase();
        TRANSIENT_ERRORS.iter().any(|m| stderr.contains(m))
    }
}

/// Tmux bridge using an external tmux server
pub struct TmuxBridge {
    config: BridgeConfig,
    /// Per-name locks serializing create-or-attach
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TmuxBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Verify tmux is installed; returns the version string.
    pub async fn detect(config: &BridgeConfig) -> Result<String> {
        let bridge = Self::new(config.clone());
        let output = bridge.run_once(&["-V"]).await?;
        if !output.success {
            return Err(TetherError::ExternalToolUnavailable(format!(
                "{} -V failed: {}",
                config.tmux_binary,
                output.stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .session_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(name.to_string()).or_default().clone()
    }

    fn forget_lock(&self, name: &str) {
        self.session_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.tmux_binary);
        if let Some(socket) = &self.config.tmux_socket {
            cmd.args(["-L", socket.as_str()]);
        }
        cmd
    }

    /// Run tmux once, bounded by the configured timeout.
    async fn run_once(&self, args: &[&str]) -> Result<TmuxOutput> {
        let mut cmd = self.base_command();
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.config.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TetherError::ExternalToolUnavailable(format!(
                    "{} not found in PATH",
                    self.config.tmux_binary
                )));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(TetherError::external(format!(
                    "tmux {} timed out after {:?}",
                    args.first().copied().unwrap_or_default(),
                    self.config.timeout
                )));
            }
        };

        Ok(TmuxOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run tmux, retrying once on a transient server race.
    async fn run(&self, args: &[&str]) -> Result<TmuxOutput> {
        let output = self.run_once(args).await?;
        if output.success || !output.is_transient() {
            return Ok(output);
        }
        debug!(
            command = args.first().copied().unwrap_or_default(),
            stderr = %output.stderr.trim(),
            "transient tmux failure, retrying"
        );
        tokio::time::sleep(RETRY_DELAY).await;
        self.run_once(args).await
    }

    fn failure(args: &[&str], output: &TmuxOutput) -> TetherError {
        TetherError::external(format!(
            "tmux {} failed: {}",
            args.first().copied().unwrap_or_default(),
            output.stderr.trim()
        ))
    }

    async fn has_session(&self, name: &str) -> Result<bool> {
        let target = format!("={}", name);
        let output = self.run(&["has-session", "-t", target.as_str()]).await?;
        Ok(output.success)
    }

    async fn create_session(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        cwd: Option<&Path>,
    ) -> Result<TmuxOutput> {
        let history = self.config.history_limit.to_string();
        let cols = cols.to_string();
        let rows = rows.to_string();
        let shell = self.config.shell_path();
        let cwd = resolve_cwd(cwd).map(|p| p.to_string_lossy().to_string());

        let mut args: Vec<&str> = Vec::new();
        // A private server is ours to configure globally; history-limit only
        // applies to panes created after it is set.
        if self.config.tmux_socket.is_some() {
            args.extend([
                "start-server",
                ";",
                "set-option",
                "-g",
                "history-limit",
                history.as_str(),
                ";",
            ]);
        }
        args.extend([
            "new-session",
            "-d",
            "-s",
            name,
            "-x",
            cols.as_str(),
            "-y",
            rows.as_str(),
        ]);
        if let Some(dir) = &cwd {
            args.extend(["-c", dir.as_str()]);
        }
        args.push(shell.as_str());

        self.run(&args).await
    }

    async fn configure_session(&self, name: &str) {
        let target = format!("={}", name);
        let history = self.config.history_limit.to_string();
        for option in [["status", "off"], ["history-limit", history.as_str()]] {
            let args = ["set-option", "-t", target.as_str(), option[0], option[1]];
            match self.run(&args).await {
                Ok(output) if !output.success => {
                    debug!(
                        session = %name,
                        option = option[0],
                        stderr = %output.stderr.trim(),
                        "tmux set-option failed"
                    );
                }
                Err(e) => {
                    debug!(
                        session = %name,
                        option = option[0],
                        error = %e,
                        "tmux set-option failed"
                    )
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl ProcessBridge for TmuxBridge {
    async fn ensure_session(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        cwd: Option<&Path>,
    ) -> Result<MultiplexerSession> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        if self.has_session(name).await? {
            debug!(session = %name, "attaching to existing tmux session");
            return Ok(MultiplexerSession {
                name: name.to_string(),
                created: false,
            });
        }

        let output = self.create_session(name, cols, rows, cwd).await?;
        if !output.success {
            if output.stderr.contains("duplicate session") {
                return Ok(MultiplexerSession {
                    name: name.to_string(),
                    created: false,
                });
            }
            return Err(Self::failure(&["new-session"], &output));
        }

        self.configure_session(name).await;
        info!(session = %name, "created tmux session");

        Ok(MultiplexerSession {
            name: name.to_string(),
            created: true,
        })
    }

    async fn session_exists(&self, name: &str) -> Result<bool> {
        self.has_session(name).await
    }

    async fn spawn_attached(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        cwd: Option<&Path>,
    ) -> Result<SpawnedProcess> {
        let mut cmd = CommandBuilder::new(&self.config.tmux_binary);
        if let Some(socket) = &self.config.tmux_socket {
            cmd.args(["-L", socket.as_str()]);
        }
        let target = format!("={}", name);
        cmd.args(["attach-session", "-t", target.as_str()]);
        cmd.env("TERM", "xterm-256color");
        // Nested-session guard would refuse to attach when the server itself runs in tmux.
        cmd.env_remove("TMUX");
        if let Some(dir) = resolve_cwd(cwd) {
            cmd.cwd(dir);
        }

        let label = name.to_string();
        tokio::task::spawn_blocking(move || pty::spawn(&label, cmd, cols, rows))
            .await
            .map_err(|e| TetherError::external(format!("PTY spawn task failed: {e}")))?
    }

    async fn capture_scrollback(&self, name: &str) -> Result<Bytes> {
        let target = format!("={}:", name);
        let args = [
            "capture-pane",
            "-p",
            "-e",
            "-S",
            "-",
            "-E",
            "-",
            "-t",
            target.as_str(),
        ];
        let output = self.run(&args).await?;
        if !output.success {
            if output.session_missing() {
                return Err(TetherError::NotFound {
                    kind: "multiplexer session",
                    id: name.to_string(),
                });
            }
            return Err(Self::failure(&args, &output));
        }
        Ok(normalize_capture(&output.stdout))
    }

    async fn destroy_session(&self, name: &str) -> Result<()> {
        let target = format!("={}", name);
        let args = ["kill-session", "-t", target.as_str()];
        let output = self.run(&args).await?;
        self.forget_lock(name);
        if output.success || output.session_missing() {
            debug!(session = %name, "destroyed tmux session");
            return Ok(());
        }
        Err(Self::failure(&args, &output))
    }

    fn is_degraded(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &str {
        "tmux"
    }
}

/// Turn `capture-pane` text into something a terminal can replay verbatim.
///
/// Trailing blank lines (the unused part of the visible screen) are dropped,
/// and bare line feeds become CRLF so each line starts at column zero.
pub(crate) fn normalize_capture(raw: &[u8]) -> Bytes {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    let trimmed = &raw[..end];

    let mut out = Vec::with_capacity(trimmed.len() + trimmed.len() / 32);
    for &b in trimmed {
        if b == b'\n' {
            out.push(b'\r');
        }
        out.push(b);
    }
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_capture_trims_and_converts_newlines() {
        let raw = b"$ echo hi\nhi\n$ \n\n\n";
        assert_eq!(&normalize_capture(raw)[..], b"$ echo hi\r\nhi\r\n$ ");
    }

    #[test]
    fn test_normalize_capture_keeps_escape_sequences() {
        let raw = b"\x1b[32mgreen\x1b[0m\n";
        assert_eq!(&normalize_capture(raw)[..], b"\x1b[32mgreen\x1b[0m");
    }

    #[test]
    fn test_normalize_capture_empty() {
        assert!(normalize_capture(b"\n\n").is_empty());
    }

    #[test]
    fn test_output_classification() {
        let missing = TmuxOutput {
            success: false,
            stdout: Vec::new(),
            stderr: "can't find session: tether_x".to_string(),
        };
        assert!(missing.session_missing());
        assert!(!missing.is_transient());

        let racing = TmuxOutput {
            success: false,
            stdout: Vec::new(),
            stderr: "server exited unexpectedly".to_string(),
        };
        assert!(racing.is_transient());
    }

    #[tokio::test]
    async fn test_detect_missing_binary_is_unavailable() {
        let config = BridgeConfig {
            tmux_binary: "/nonexistent/tether-tmux".to_string(),
            ..BridgeConfig::default()
        };
        let err = TmuxBridge::detect(&config).await.unwrap_err();
        assert!(matches!(err, TetherError::ExternalToolUnavailable(_)));
    }
}
