//! WebSocket transport
//!
//! Upgrade handling, the per-connection pump and the user → sink registry.

pub mod handler;
pub mod pump;
pub mod registry;

pub use handler::ws_upgrade;
pub use pump::{run_connection, PumpContext};
pub use registry::{ConnectionId, ConnectionRegistry, Registration};
