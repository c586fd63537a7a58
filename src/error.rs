//! Error types
//!
//! One error enum per seam: the GATT link, the key handshake and the
//! authorization store. Application-level code wraps these in `anyhow`.

use crate::domain::models::LinkState;
use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by [`GattLink`](crate::infrastructure::bluetooth::connection::GattLink)
/// and the scan session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GattError {
    #[error("invalid Bluetooth address: {0:?}")]
    InvalidAddress(String),

    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,

    #[error("link is busy with {current}")]
    LinkBusy { current: String },

    #[error("link has been closed")]
    LinkClosed,

    #[error("service discovery failed")]
    ServiceDiscoveryFailed,

    #[error("characteristic {characteristic} of service {service} not found")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    #[error("link not ready (state: {0})")]
    NotReady(LinkState),

    #[error("transport disconnected: {0}")]
    TransportDisconnected(String),

    #[error("peripheral has not authorized this controller")]
    Unauthorized,
}

/// Errors reported by the RFCOMM key handshake.
///
/// Every variant is produced only after the socket has been shut down.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("expected {expected:?}, peer sent {received:?}")]
    UnexpectedMessage { expected: String, received: String },

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("handshake aborted")]
    Aborted,

    #[error("token is not a single line of ASCII text")]
    InvalidToken,

    #[error("failed to commit the received token: {0}")]
    Commit(String),

    #[error("no peripheral connected whose key could be handed over")]
    NoPeripheral,
}

impl HandshakeError {
    /// Map an I/O error raised by a blocking read/write into the taxonomy.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::UnexpectedEof => Self::PeerClosed,
            _ => Self::Io(err),
        }
    }
}

/// Errors reported by the authorization store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("store file is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_map_to_timeout() {
        let err = HandshakeError::from_io(io::Error::new(io::ErrorKind::WouldBlock, "slow"));
        assert!(matches!(err, HandshakeError::Timeout));

        let err = HandshakeError::from_io(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(err, HandshakeError::Timeout));
    }

    #[test]
    fn test_other_io_is_kept() {
        let err = HandshakeError::from_io(io::Error::new(io::ErrorKind::ConnectionReset, "rst"));
        assert!(matches!(err, HandshakeError::Io(_)));
    }

    #[test]
    fn test_not_ready_mentions_state() {
        let msg = GattError::NotReady(LinkState::Connecting).to_string();
        assert!(msg.contains("Connecting"));
    }
}
