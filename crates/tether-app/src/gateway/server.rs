use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

use tether_terminal::{detect_bridge, TerminalRegistry};
use tether_types::{MemoryStore, SessionStore};

use crate::auth::TokenAuthenticator;
use crate::config::{Config, StoreKind};
use crate::persistence::JsonFileStore;
use crate::sessions::SessionDirectory;

use super::routes::{create_router, AppState};

/// Wire the store, bridge, registry, directory and authenticator together.
pub async fn build_state(config: &Config) -> Result<AppState> {
    let store: Arc<dyn SessionStore> = match config.store {
        StoreKind::Json => {
            let dir = config.resolved_data_dir()?;
            let store = JsonFileStore::open(&dir)
                .await
                .with_context(|| format!("Failed to open data directory: {}", dir.display()))?;
            info!(data_dir = %dir.display(), "using JSON file store");
            Arc::new(store)
        }
        StoreKind::Memory => {
            warn!("using in-memory store; sessions will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let bridge = detect_bridge(config.bridge_config()).await;
    let registry = TerminalRegistry::new(bridge, store.clone(), config.registry_config());
    let directory = Arc::new(SessionDirectory::new(
        store,
        registry.clone(),
        config.session_cache_size,
    ));

    let auth = TokenAuthenticator::from_users(&config.users);
    if auth.is_empty() {
        warn!("no users configured; every connection will be rejected");
    }

    Ok(AppState {
        registry,
        directory,
        auth: Arc::new(auth),
    })
}

/// Run the gateway until Ctrl+C or SIGTERM.
///
/// On shutdown every attach process is killed but multiplexer sessions are
/// left running, so the next start can restore them.
pub async fn serve(config: Config) -> Result<()> {
    let addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.bind))?;

    let state = build_state(&config).await?;
    let registry = state.registry.clone();

    let reaper = config.idle_timeout().map(|max_idle| {
        info!(max_idle_secs = max_idle.as_secs(), "idle eviction enabled");
        registry.spawn_idle_reaper(config.idle_scan_interval(), max_idle)
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    let app = create_router(state).layer(trace_layer).layer(cors);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(
        addr = %addr,
        backend = registry.bridge().backend_name(),
        degraded = registry.is_degraded(),
        "tether listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    let detached = registry.detach_all();
    info!(detached, "shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, detaching terminals");
}
