//! RFCOMM socket capabilities
//!
//! The key handoff only needs a reliable, bidirectional byte stream plus a
//! way to tear it down from another thread. Platform backends implement
//! these traits; [`tcp`](super::tcp) provides one over TCP.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Closes a stream or listener from any thread, unblocking pending I/O.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<dyn Fn() + Send + Sync>);

impl ShutdownHandle {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn shutdown(&self) {
        (self.0)()
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShutdownHandle")
    }
}

/// A connected stream socket.
pub trait RfcommStream: Read + Write + Send {
    /// Apply a timeout to blocking reads; `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Handle that shuts the socket down in both directions.
    fn shutdown_handle(&self) -> io::Result<ShutdownHandle>;

    /// Address of the remote device.
    fn peer_address(&self) -> String;
}

/// A server channel waiting for one incoming connection.
pub trait RfcommListener: Send {
    /// Block until a peer connects.
    fn accept(&mut self) -> io::Result<Box<dyn RfcommStream>>;

    /// Handle that stops listening and unblocks a pending `accept`.
    fn close_handle(&self) -> io::Result<ShutdownHandle>;

    /// Local address the channel listens on.
    fn local_address(&self) -> String;
}

/// Opens and listens for RFCOMM channels identified by a service record.
pub trait RfcommAdapter: Send + Sync {
    /// Open a channel to `peer`, giving up after `timeout` when one is set.
    fn connect(
        &self,
        peer: &str,
        service: Uuid,
        timeout: Option<Duration>,
    ) -> io::Result<Box<dyn RfcommStream>>;

    fn listen(&self, name: &str, service: Uuid) -> io::Result<Box<dyn RfcommListener>>;
}
