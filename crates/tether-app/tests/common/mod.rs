#![allow(dead_code)]

use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use tether::gateway::{AppState, ClientMessage, Connection, ServerMessage, OUTBOUND_CAPACITY};
use tether::{SessionDirectory, TokenAuthenticator};
use tether_terminal::testing::FakeBridge;
use tether_terminal::{RegistryConfig, TerminalRegistry};
use tether_types::{MemoryStore, SessionStore};

pub const ALICE_TOKEN: &str = "tok-alice";
pub const BOB_TOKEN: &str = "tok-bob";

/// How long to wait for a frame before failing the test
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Gateway wired to a fake bridge and an in-memory store
pub struct TestFixtures {
    pub bridge: FakeBridge,
    pub store: Arc<MemoryStore>,
    pub registry: TerminalRegistry,
    pub directory: Arc<SessionDirectory>,
    pub state: AppState,
}

impl TestFixtures {
    pub fn new() -> Self {
        Self::with_bridge(FakeBridge::new())
    }

    pub fn with_bridge(bridge: FakeBridge) -> Self {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn SessionStore> = store.clone();
        let registry = TerminalRegistry::new(
            Arc::new(bridge.clone()),
            dyn_store.clone(),
            RegistryConfig::default(),
        );
        let directory = Arc::new(SessionDirectory::new(dyn_store, registry.clone(), 16));

        let mut auth = TokenAuthenticator::new();
        auth.insert(ALICE_TOKEN, "u-alice", "alice");
        auth.insert(BOB_TOKEN, "u-bob", "bob");

        let state = AppState {
            registry: registry.clone(),
            directory: directory.clone(),
            auth: Arc::new(auth),
        };

        Self {
            bridge,
            store,
            registry,
            directory,
            state,
        }
    }

    /// A client that has not authenticated yet.
    pub fn client(&self) -> TestClient {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        TestClient {
            conn: Connection::new(self.state.clone(), tx),
            rx,
        }
    }

    /// A client authenticated with `token`.
    pub async fn login(&self, token: &str) -> TestClient {
        let mut client = self.client();
        client
            .send(ClientMessage::Authenticate {
                token: token.to_string(),
            })
            .await;
        match client.recv().await {
            ServerMessage::Authenticated { .. } => client,
            other => panic!("expected authenticated, got {:?}", other),
        }
    }
}

/// In-process stand-in for a WebSocket client
pub struct TestClient {
    pub conn: Connection,
    pub rx: mpsc::Receiver<ServerMessage>,
}

impl TestClient {
    pub async fn send(&mut self, msg: ClientMessage) -> ControlFlow<()> {
        self.conn.handle(msg).await
    }

    pub async fn send_json(&mut self, value: Value) -> ControlFlow<()> {
        self.conn.handle_text(&value.to_string()).await
    }

    pub async fn recv(&mut self) -> ServerMessage {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a server message")
            .expect("connection channel closed")
    }

    /// Assert nothing else is queued by round-tripping a ping.
    pub async fn expect_quiet(&mut self) {
        self.send(ClientMessage::Ping).await;
        assert_eq!(self.recv().await, ServerMessage::Pong);
    }

    /// Create a session and return its id.
    pub async fn create_session(&mut self, name: &str) -> String {
        self.send(ClientMessage::CreateSession {
            name: Some(name.to_string()),
        })
        .await;
        match self.recv().await {
            ServerMessage::SessionCreated { session } => session.id,
            other => panic!("expected session-created, got {:?}", other),
        }
    }

    /// Create a terminal in `session_id` and return its id.
    pub async fn create_terminal(&mut self, session_id: &str, panel_id: Option<&str>) -> String {
        self.send(ClientMessage::CreateTerminal {
            session_id: session_id.to_string(),
            cols: 80,
            rows: 24,
            panel_id: panel_id.map(str::to_string),
        })
        .await;
        match self.recv().await {
            ServerMessage::TerminalCreated { terminal_id, .. } => terminal_id,
            other => panic!("expected terminal-created, got {:?}", other),
        }
    }

    /// Collect output frames of `terminal_id` until `expected` bytes of text arrived.
    pub async fn collect_output(&mut self, terminal_id: &str, expected: usize) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut total = 0;
        while total < expected {
            match self.recv().await {
                ServerMessage::TerminalOutput {
                    terminal_id: id,
                    data,
                } if id == terminal_id => {
                    total += data.len();
                    chunks.push(data);
                }
                other => panic!("expected terminal-output, got {:?}", other),
            }
        }
        chunks
    }
}
