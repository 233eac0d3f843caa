use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use tether_terminal::BackendType;

use crate::config::{Config, StoreKind};

/// CLI arguments for tether
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Persistent, shareable terminal sessions over WebSocket")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to a TOML config file
    #[arg(long, short = 'c', value_name = "PATH", env = "TETHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g. 127.0.0.1:7681)
    #[arg(long, value_name = "ADDR", env = "TETHER_BIND")]
    pub bind: Option<String>,

    /// Directory for persisted sessions and terminal records
    #[arg(long, value_name = "DIR", env = "TETHER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Persistence adapter
    #[arg(long, value_enum, env = "TETHER_STORE")]
    pub store: Option<StoreKind>,

    /// Terminal backend (tmux, plain)
    #[arg(long, value_name = "BACKEND", env = "TETHER_BACKEND")]
    pub backend: Option<BackendType>,

    /// Private tmux server socket name (tmux -L); empty for the default server
    #[arg(long, value_name = "NAME", env = "TETHER_TMUX_SOCKET")]
    pub tmux_socket: Option<String>,

    /// Shell started inside new sessions
    #[arg(long, value_name = "PATH", env = "TETHER_SHELL")]
    pub shell: Option<String>,

    /// Close terminals idle for this many seconds (0 disables)
    #[arg(long, value_name = "SECS", env = "TETHER_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Generate shell completions
    #[arg(long, value_enum)]
    pub generate: Option<Shell>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the gateway (default)
    Serve,
    /// Check tmux availability and configuration, then exit
    Doctor,
}

impl Cli {
    /// Apply flag and environment overrides on top of the file config.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(store) = self.store {
            config.store = store;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(socket) = &self.tmux_socket {
            config.tmux_socket = Some(socket.clone());
        }
        if let Some(shell) = &self.shell {
            config.shell = Some(shell.clone());
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
    }
}
