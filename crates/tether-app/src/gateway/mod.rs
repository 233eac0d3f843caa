// WebSocket gateway
pub mod connection;
pub mod error;
pub mod protocol;
pub mod routes;
pub mod server;
pub mod view;

pub use connection::{Connection, OUTBOUND_CAPACITY};
pub use error::{ApiError, ApiResult};
pub use protocol::{ClientMessage, ServerMessage};
pub use routes::{create_router, AppState};
pub use server::{build_state, serve};
pub use view::{View, ViewState};
