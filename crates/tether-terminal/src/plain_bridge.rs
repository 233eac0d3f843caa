/// Plain PTY bridge used when tmux is unavailable (degraded mode)
///
/// Every spawn is a fresh shell that dies with its attach process, so nothing
/// survives a server restart and there is no history to capture.
use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::CommandBuilder;
use std::path::Path;

use tether_types::{Result, TetherError};

use super::bridge::{
    resolve_cwd, BridgeConfig, MultiplexerSession, ProcessBridge, SpawnedProcess,
};
use super::pty;

pub struct PlainBridge {
    config: BridgeConfig,
}

impl PlainBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProcessBridge for PlainBridge {
    async fn ensure_session(
        &self,
        name: &str,
        _cols: u16,
        _rows: u16,
        _cwd: Option<&Path>,
    ) -> Result<MultiplexerSession> {
        Ok(MultiplexerSession {
            name: name.to_string(),
            created: true,
        })
    }

    async fn session_exists(&self, _name: &str) -> Result<bool> {
        Ok(false)
    }

    async fn spawn_attached(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        cwd: Option<&Path>,
    ) -> Result<SpawnedProcess> {
        let mut cmd = CommandBuilder::new(self.config.shell_path());
        cmd.env("TERM", "xterm-256color");
        if let Some(dir) = resolve_cwd(cwd) {
            cmd.cwd(dir);
        }

        let label = name.to_string();
        tokio::task::spawn_blocking(move || pty::spawn(&label, cmd, cols, rows))
            .await
            .map_err(|e| TetherError::external(format!("PTY spawn task failed: {e}")))?
    }

    async fn capture_scrollback(&self, name: &str) -> Result<Bytes> {
        Err(TetherError::NotFound {
            kind: "multiplexer session",
            id: name.to_string(),
        })
    }

    async fn destroy_session(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn is_degraded(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &str {
        "plain"
    }
}
