//! Core types and structures for tether
//!
//! This crate provides the foundational types shared by the terminal engine
//! and the gateway: session/layout rows, terminal records, the error taxonomy
//! and the persistence collaborator interface.

pub mod error;
pub mod model;
pub mod store;

pub use error::{Result, TetherError};
pub use model::{
    AuthenticatedUser, Layout, Panel, Session, SessionId, TerminalId, TerminalRecord, UserId,
};
pub use store::{MemoryStore, SessionStore};

// ============================================================================
// Constants
// ============================================================================

/// Default terminal width used when a client does not report one
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height used when a client does not report one
pub const DEFAULT_ROWS: u16 = 24;

/// Upper bound accepted for either terminal dimension
pub const MAX_DIMENSION: u16 = 1000;

/// Clamp client-reported geometry into a range the PTY layer accepts.
pub fn clamp_geometry(cols: u16, rows: u16) -> (u16, u16) {
    let cols = if cols == 0 { DEFAULT_COLS } else { cols.min(MAX_DIMENSION) };
    let rows = if rows == 0 { DEFAULT_ROWS } else { rows.min(MAX_DIMENSION) };
    (cols, rows)
}
