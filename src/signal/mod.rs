//! Signaling: one persistent websocket to the rendezvous service.

mod client;

pub use client::{endpoint_with_identity, ReconnectSchedule, SignalClient, SignalEvent};

#[cfg(feature = "signaling-server")]
pub mod server;

#[cfg(feature = "signaling-server")]
pub use server::router as signaling_router;

/// Heartbeat payload expected by the signaling service.
pub const HEARTBEAT_FRAME: &str = "@heart";
