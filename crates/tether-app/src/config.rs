//! Server configuration: TOML file, then CLI/env overrides.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tether_terminal::{BackendType, BridgeConfig, RegistryConfig, DEFAULT_EVENT_CAPACITY};

/// Which persistence adapter backs sessions and terminal records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// One JSON file per row under the data directory
    #[default]
    Json,
    /// Nothing survives a restart
    Memory,
}

/// A user allowed to connect, identified by a static bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub data_dir: PathBuf,
    pub store: StoreKind,
    pub backend: BackendType,
    pub tmux_binary: String,
    /// Private tmux server socket name; empty string means the default server
    pub tmux_socket: Option<String>,
    pub history_limit: u32,
    pub shell: Option<String>,
    pub default_cwd: Option<PathBuf>,
    pub scrollback_bytes: usize,
    pub bridge_timeout_ms: u64,
    /// Quiet period that ends the redraw swallowed when re-attaching to tmux
    pub attach_settle_ms: u64,
    /// Zero disables idle eviction
    pub idle_timeout_secs: u64,
    pub idle_scan_secs: u64,
    pub session_cache_size: usize,
    pub users: Vec<UserConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let bridge = BridgeConfig::default();
        Self {
            bind: "127.0.0.1:7681".to_string(),
            data_dir: PathBuf::from("~/.local/share/tether"),
            store: StoreKind::Json,
            backend: BackendType::Tmux,
            tmux_binary: bridge.tmux_binary,
            tmux_socket: bridge.tmux_socket,
            history_limit: bridge.history_limit,
            shell: None,
            default_cwd: None,
            scrollback_bytes: tether_terminal::DEFAULT_SCROLLBACK_BYTES,
            bridge_timeout_ms: bridge.timeout.as_millis() as u64,
            attach_settle_ms: RegistryConfig::default().attach_settle.as_millis() as u64,
            idle_timeout_secs: 0,
            idle_scan_secs: 60,
            session_cache_size: 256,
            users: Vec::new(),
        }
    }
}

impl Config {
    /// Load from `path`, or return defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind.trim().is_empty() {
            bail!("bind address must not be empty");
        }
        let mut seen = std::collections::HashSet::new();
        for user in &self.users {
            if user.token.trim().is_empty() {
                bail!("user {} has an empty token", user.user_id);
            }
            if !seen.insert(user.token.as_str()) {
                bail!("token of user {} is shared with another user", user.user_id);
            }
        }
        Ok(())
    }

    /// Data directory with `~` expanded.
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        expand_tilde(&self.data_dir)
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            backend: self.backend,
            tmux_binary: self.tmux_binary.clone(),
            tmux_socket: self.tmux_socket.clone().filter(|s| !s.is_empty()),
            history_limit: self.history_limit,
            shell: self.shell.clone(),
            timeout: Duration::from_millis(self.bridge_timeout_ms.max(1)),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            scrollback_bytes: self.scrollback_bytes,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            default_cwd: self.default_cwd.clone(),
            capture_timeout: Duration::from_millis(self.bridge_timeout_ms.max(1)),
            attach_settle: Duration::from_millis(self.attach_settle_ms),
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn idle_scan_interval(&self) -> Duration {
        Duration::from_secs(self.idle_scan_secs.max(1))
    }
}

/// Expand ~ to home directory
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    if !path.starts_with("~") {
        return Ok(path.to_path_buf());
    }
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(expand_tilde_with(path, Path::new(&home)))
}

/// Expand a leading `~` against `home`.
fn expand_tilde_with(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) if rest.as_os_str().is_empty() => home.to_path_buf(),
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}
