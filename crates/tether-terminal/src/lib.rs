// Terminal engine
//
// Binds terminal ids to long-lived tmux sessions through a process bridge,
// keeps live PTY processes in a registry, and fans their output out to any
// number of subscribers.

pub mod bridge;
mod clock;
mod plain_bridge;
mod pty;
mod registry;
mod sanitize;
mod scrollback;
mod terminal;
mod tmux_bridge;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// Re-export public API
pub use bridge::{
    check_multiplexer_ids, detect_bridge, multiplexer_name, BackendType, BridgeConfig,
    MultiplexerSession, ProcessBridge, ProcessHandle, SpawnedProcess,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use plain_bridge::PlainBridge;
pub use registry::{RegistryConfig, TerminalRegistry};
pub use sanitize::OutputScrubber;
pub use scrollback::ScrollbackBuffer;
pub use terminal::{Terminal, TerminalEvent, TerminalInfo};
pub use tmux_bridge::TmuxBridge;

// Constants
pub const DEFAULT_SCROLLBACK_BYTES: usize = 256 * 1024;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
