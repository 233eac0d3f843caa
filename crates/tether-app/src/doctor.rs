//! `tether doctor`: report whether this host can run persistent terminals.

use std::fmt::Write as _;
use std::path::Path;

use tether_terminal::{BackendType, TmuxBridge};

use crate::config::{Config, StoreKind};
use crate::persistence::JsonFileStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl Check {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: false,
            detail: detail.into(),
        }
    }
}

pub async fn run_checks(config: &Config) -> Vec<Check> {
    let mut checks = Vec::new();
    let bridge = config.bridge_config();

    checks.push(match config.bind.parse::<std::net::SocketAddr>() {
        Ok(addr) => Check::pass("bind", addr.to_string()),
        Err(e) => Check::fail("bind", format!("{}: {}", config.bind, e)),
    });

    checks.push(match config.backend {
        BackendType::Plain => Check::pass("backend", "plain (terminals end with the server)"),
        BackendType::Tmux => match TmuxBridge::detect(&bridge).await {
            Ok(version) => Check::pass("backend", format!("tmux ({})", version.trim())),
            Err(e) => Check::fail("backend", format!("{} (would fall back to plain)", e)),
        },
    });

    let shell = bridge.shell_path();
    checks.push(if Path::new(&shell).exists() {
        Check::pass("shell", shell)
    } else {
        Check::fail("shell", format!("{} not found", shell))
    });

    checks.push(match config.store {
        StoreKind::Memory => Check::pass("store", "memory (nothing is persisted)"),
        StoreKind::Json => match config.resolved_data_dir() {
            Ok(dir) => match JsonFileStore::open(&dir).await {
                Ok(_) => Check::pass("store", format!("json at {}", dir.display())),
                Err(e) => Check::fail("store", format!("{}: {}", dir.display(), e)),
            },
            Err(e) => Check::fail("store", e.to_string()),
        },
    });

    checks.push(if config.users.is_empty() {
        Check::fail("users", "no users configured, every connection will be rejected")
    } else {
        Check::pass("users", format!("{} configured", config.users.len()))
    });

    checks
}

pub fn render(checks: &[Check]) -> String {
    let mut out = String::new();
    for check in checks {
        let mark = if check.ok { "ok" } else { "FAIL" };
        let _ = writeln!(out, "[{:>4}] {:<8} {}", mark, check.name, check.detail);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_memory_config_without_users() {
        let config = Config {
            backend: BackendType::Plain,
            store: StoreKind::Memory,
            shell: Some("/bin/sh".into()),
            ..Config::default()
        };
        let checks = run_checks(&config).await;

        let by_name = |name: &str| checks.iter().find(|c| c.name == name).cloned().unwrap();
        assert!(by_name("bind").ok);
        assert!(by_name("backend").ok);
        assert!(by_name("store").ok);
        assert!(!by_name("users").ok);

        let report = render(&checks);
        assert!(report.contains("[FAIL] users"));
    }

    #[tokio::test]
    async fn test_bad_bind_address_fails() {
        let config = Config {
            bind: "not-an-address".into(),
            backend: BackendType::Plain,
            store: StoreKind::Memory,
            ..Config::default()
        };
        let checks = run_checks(&config).await;
        assert!(!checks[0].ok);
    }
}
