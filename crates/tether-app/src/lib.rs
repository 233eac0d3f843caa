//! tether gateway library
//!
//! Session directory, WebSocket gateway, JSON persistence adapter and the
//! binary's configuration. The terminal engine lives in `tether-terminal`.

// Re-export workspace crates
pub use tether_terminal::{self as terminal, TerminalRegistry};
pub use tether_types::{self as types, Layout, Panel, Session, TetherError};

pub mod auth;
pub mod cli;
pub mod config;
pub mod doctor;
pub mod gateway;
pub mod logging;
pub mod persistence;
pub mod sessions;

pub use auth::{Authenticator, TokenAuthenticator};
pub use config::Config;
pub use persistence::JsonFileStore;
pub use sessions::SessionDirectory;
