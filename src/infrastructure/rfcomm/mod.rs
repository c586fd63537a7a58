//! Classic Bluetooth key handoff
//!
//! - `socket`: stream/listener capabilities a platform provides
//! - `tcp`: TCP implementation of those capabilities
//! - `handshake`: the GET/DONE token exchange running on worker threads

pub mod handshake;
pub mod socket;
pub mod tcp;

pub use handshake::{spawn_initiator, spawn_responder, AbortHandle, HandshakeConfig, HandshakeHandle};
pub use socket::{RfcommAdapter, RfcommListener, RfcommStream, ShutdownHandle};
pub use tcp::TcpRfcomm;
