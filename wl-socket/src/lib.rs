//! Waveline Socket - the persistent chat connection.
//!
//! This crate provides:
//! - The `Transport` seam with a WebSocket implementation over
//!   `tokio-tungstenite`
//! - The connection manager: state machine, bounded-retry connect, writer and
//!   heartbeat loops, the reader path, and single-flight reconnection

pub mod manager;
pub mod transport;

// Re-export key types
pub use manager::{ConnectionManager, ConnectionState};
pub use transport::{OpenRequest, Transport, TransportEvent, TransportSink, TransportStream, WsTransport};
