//! TCP stand-in for the RFCOMM channel
//!
//! Carries the key handoff over loopback or LAN when no classic Bluetooth
//! stack is available. Peers are addressed as `host:port`; the service
//! record is not used.

use crate::infrastructure::rfcomm::socket::{
    RfcommAdapter, RfcommListener, RfcommStream, ShutdownHandle,
};
use std::io::{self, Read, Write};
use std::net::{
    Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub struct TcpRfcommStream {
    stream: TcpStream,
    peer: String,
}

impl TcpRfcommStream {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Self { stream, peer }
    }
}

impl Read for TcpRfcommStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpRfcommStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl RfcommStream for TcpRfcommStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        let stream = self.stream.try_clone()?;
        Ok(ShutdownHandle::new(move || {
            // NotConnected once the peer is already gone
            let _ = stream.shutdown(Shutdown::Both);
        }))
    }

    fn peer_address(&self) -> String {
        self.peer.clone()
    }
}

pub struct TcpRfcommListener {
    listener: TcpListener,
    closed: Arc<AtomicBool>,
}

impl RfcommListener for TcpRfcommListener {
    fn accept(&mut self) -> io::Result<Box<dyn RfcommStream>> {
        let (stream, peer) = self.listener.accept()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "listener closed",
            ));
        }
        info!("Socket accepted from {}", peer);
        Ok(Box::new(TcpRfcommStream::new(stream)))
    }

    fn close_handle(&self) -> io::Result<ShutdownHandle> {
        let mut wake = self.listener.local_addr()?;
        if wake.ip().is_unspecified() {
            wake = match wake {
                SocketAddr::V4(a) => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), a.port()),
                SocketAddr::V6(a) => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), a.port()),
            };
        }

        let closed = self.closed.clone();
        Ok(ShutdownHandle::new(move || {
            if !closed.swap(true, Ordering::SeqCst) {
                // std has no way to interrupt accept(); a throwaway connection wakes it
                let _ = TcpStream::connect_timeout(&wake, Duration::from_millis(500));
                debug!("Server socket closed on cancel");
            }
        }))
    }

    fn local_address(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}

/// [`RfcommAdapter`] over TCP.
pub struct TcpRfcomm {
    bind: String,
}

impl TcpRfcomm {
    /// `bind` is the listen address used by [`listen`](RfcommAdapter::listen),
    /// e.g. `127.0.0.1:0` for an ephemeral port.
    pub fn new(bind: impl Into<String>) -> Self {
        Self { bind: bind.into() }
    }
}

impl RfcommAdapter for TcpRfcomm {
    fn connect(
        &self,
        peer: &str,
        service: Uuid,
        timeout: Option<Duration>,
    ) -> io::Result<Box<dyn RfcommStream>> {
        debug!("Connecting to {} for service {}", peer, service);
        let stream = match timeout {
            Some(timeout) => connect_timeout(peer, timeout)?,
            None => TcpStream::connect(peer)?,
        };
        Ok(Box::new(TcpRfcommStream::new(stream)))
    }

    fn listen(&self, name: &str, service: Uuid) -> io::Result<Box<dyn RfcommListener>> {
        let listener = TcpListener::bind(&self.bind)?;
        info!(
            "Listening for {} ({}) on {}",
            name,
            service,
            listener.local_addr()?
        );
        Ok(Box::new(TcpRfcommListener {
            listener,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// First resolved address that accepts within `timeout`.
fn connect_timeout(peer: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last = None;
    for addr in peer.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{} resolves to nothing", peer))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_close_handle_unblocks_accept() {
        let adapter = TcpRfcomm::new("127.0.0.1:0");
        let mut listener = adapter.listen("test", Uuid::nil()).unwrap();
        let close = listener.close_handle().unwrap();

        let waiter = thread::spawn(move || listener.accept().map(|_| ()));
        thread::sleep(Duration::from_millis(50));
        close.shutdown();

        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn test_shutdown_unblocks_read() {
        let adapter = TcpRfcomm::new("127.0.0.1:0");
        let mut listener = adapter.listen("test", Uuid::nil()).unwrap();
        let addr = listener.local_address();

        let _client = adapter.connect(&addr, Uuid::nil(), None).unwrap();
        let mut server = listener.accept().unwrap();
        let shutdown = server.shutdown_handle().unwrap();

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 8];
            server.read(&mut buf)
        });
        thread::sleep(Duration::from_millis(50));
        shutdown.shutdown();

        // Shut down sockets read as EOF
        assert_eq!(reader.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_connect_to_closed_port_is_refused() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let adapter = TcpRfcomm::new("127.0.0.1:0");
        let err = adapter
            .connect(
                &format!("127.0.0.1:{}", port),
                Uuid::nil(),
                Some(Duration::from_secs(1)),
            )
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
