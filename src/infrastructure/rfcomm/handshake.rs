//! Key handoff handshake
//!
//! Two controllers move an authorization token over one RFCOMM stream using
//! newline-terminated UTF-8 lines:
//!
//! ```text
//! initiator                      responder
//!     | ---- <token>\n ----------->  |
//!     | <--- GET\n ----------------  |
//!     | ---- DONE\n -------------->  |   commit(token)
//!     | <--- (close) --------------  |
//! ```
//!
//! Each side runs on its own worker thread with blocking I/O. The socket is
//! shut down on every exit path before the outcome is reported, and
//! [`AbortHandle::abort`] unblocks a worker stuck in accept, read or write.

use crate::domain::models::{HandshakePhase, HandshakeRole, HandshakeSession};
use crate::domain::settings::KeyExchangeSettings;
use crate::error::HandshakeError;
use crate::infrastructure::bluetooth::protocol::{self, handshake::{DONE, GET}};
use crate::infrastructure::rfcomm::socket::{RfcommAdapter, RfcommListener, RfcommStream, ShutdownHandle};
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest line accepted from the peer, newline included.
const MAX_LINE: u64 = 1024;

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub service_uuid: Uuid,
    pub service_name: String,
    /// Applied to every blocking read; `None` waits forever
    pub read_timeout: Option<Duration>,
    /// How long the initiator waits for the responder to hang up after `DONE`
    pub close_linger: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::KEY_EXCHANGE_UUID,
            service_name: protocol::KEY_EXCHANGE_NAME.to_string(),
            read_timeout: Some(Duration::from_secs(30)),
            close_linger: Duration::from_secs(2),
        }
    }
}

impl From<&KeyExchangeSettings> for HandshakeConfig {
    fn from(settings: &KeyExchangeSettings) -> Self {
        Self {
            service_uuid: settings.service_uuid,
            service_name: settings.service_name.clone(),
            read_timeout: match settings.read_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            close_linger: Duration::from_millis(settings.close_linger_ms),
        }
    }
}

#[derive(Default)]
struct AbortState {
    aborted: bool,
    finished: bool,
    next_id: usize,
    closers: Vec<(usize, ShutdownHandle)>,
}

/// Cancels a running handshake from any thread.
#[derive(Clone, Default)]
pub struct AbortHandle {
    state: Arc<Mutex<AbortState>>,
}

impl AbortHandle {
    fn lock(&self) -> MutexGuard<'_, AbortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Force-close the socket and unblock the worker. No-op once the handshake finished.
    pub fn abort(&self) {
        let closers = {
            let mut state = self.lock();
            if state.finished || state.aborted {
                return;
            }
            state.aborted = true;
            std::mem::take(&mut state.closers)
        };
        info!("Aborting key handshake");
        for (_, closer) in closers {
            closer.shutdown();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Track `closer` until the handshake finishes; fails if already aborted.
    fn register(&self, closer: ShutdownHandle) -> Result<usize, HandshakeError> {
        let mut state = self.lock();
        if state.aborted {
            drop(state);
            closer.shutdown();
            return Err(HandshakeError::Aborted);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.closers.push((id, closer));
        Ok(id)
    }

    /// Stop tracking a socket that was already released.
    fn unregister(&self, id: usize) {
        self.lock().closers.retain(|(tracked, _)| *tracked != id);
    }

    /// Release every tracked socket. Called once per handshake, on every exit path.
    fn finish(&self) {
        let closers = {
            let mut state = self.lock();
            state.finished = true;
            std::mem::take(&mut state.closers)
        };
        for (_, closer) in closers {
            closer.shutdown();
        }
    }
}

/// Shared view of the handshake's progress.
#[derive(Clone)]
struct Progress {
    session: Arc<Mutex<HandshakeSession>>,
}

impl Progress {
    fn new(role: HandshakeRole, peer: &str, token: &str) -> Self {
        let phase = match role {
            HandshakeRole::Initiator => HandshakePhase::Idle,
            HandshakeRole::Responder => HandshakePhase::Listening,
        };
        Self {
            session: Arc::new(Mutex::new(HandshakeSession {
                role,
                peer_address: peer.to_string(),
                token: token.to_string(),
                phase,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandshakeSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, phase: HandshakePhase) {
        let mut session = self.lock();
        debug!("{:?} handshake: {:?} -> {:?}", session.role, session.phase, phase);
        session.phase = phase;
    }

    fn snapshot(&self) -> HandshakeSession {
        self.lock().clone()
    }
}

/// A handshake running on its worker thread.
pub struct HandshakeHandle {
    progress: Progress,
    abort: AbortHandle,
    worker: JoinHandle<Result<HandshakeSession, HandshakeError>>,
}

impl HandshakeHandle {
    pub fn role(&self) -> HandshakeRole {
        self.progress.lock().role
    }

    pub fn phase(&self) -> HandshakePhase {
        self.progress.lock().phase
    }

    pub fn session(&self) -> HandshakeSession {
        self.progress.snapshot()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the worker and return the final session.
    pub fn join(self) -> Result<HandshakeSession, HandshakeError> {
        match self.worker.join() {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "handshake worker panicked",
            ))),
        }
    }
}

/// Connect to `peer` and hand over `token`.
pub fn spawn_initiator(
    adapter: Arc<dyn RfcommAdapter>,
    peer: &str,
    token: &str,
    config: HandshakeConfig,
) -> Result<HandshakeHandle, HandshakeError> {
    // The newline must still fit in the peer's line limit
    if token.is_empty()
        || token.len() as u64 >= MAX_LINE
        || !token.is_ascii()
        || token.contains(['\r', '\n'])
    {
        return Err(HandshakeError::InvalidToken);
    }

    let progress = Progress::new(HandshakeRole::Initiator, peer, token);
    let abort = AbortHandle::default();

    let worker = {
        let progress = progress.clone();
        let abort = abort.clone();
        let peer = peer.to_string();
        let token = token.to_string();
        thread::Builder::new()
            .name("key-initiator".to_string())
            .spawn(move || {
                let result = connect_and_run(&*adapter, &peer, &token, &config, &progress, &abort);
                conclude(result, &progress, &abort)
            })?
    };

    Ok(HandshakeHandle {
        progress,
        abort,
        worker,
    })
}

/// Accept one connection on `listener` and receive a token.
///
/// The listener is dropped as soon as a peer is accepted. `commit` runs on
/// the worker thread, once, after `DONE` was received; its error fails the
/// handshake.
pub fn spawn_responder<F>(
    mut listener: Box<dyn RfcommListener>,
    config: HandshakeConfig,
    commit: F,
) -> Result<HandshakeHandle, HandshakeError>
where
    F: FnOnce(&HandshakeSession) -> Result<(), String> + Send + 'static,
{
    let progress = Progress::new(HandshakeRole::Responder, "", "");
    let abort = AbortHandle::default();
    let listening = abort.register(listener.close_handle()?)?;

    let worker = {
        let progress = progress.clone();
        let abort = abort.clone();
        thread::Builder::new()
            .name("key-responder".to_string())
            .spawn(move || {
                let accepted = listener.accept();
                // Single-shot: stop listening whatever the outcome
                drop(listener);
                abort.unregister(listening);
                let result = match accepted {
                    Ok(stream) => respond(stream, &config, &progress, &abort, commit),
                    Err(_) if abort.is_aborted() => Err(HandshakeError::Aborted),
                    Err(e) => Err(HandshakeError::Io(e)),
                };
                conclude(result, &progress, &abort)
            })?
    };

    Ok(HandshakeHandle {
        progress,
        abort,
        worker,
    })
}

fn conclude(
    result: Result<(), HandshakeError>,
    progress: &Progress,
    abort: &AbortHandle,
) -> Result<HandshakeSession, HandshakeError> {
    // Socket release precedes reporting the outcome
    abort.finish();
    let aborted = abort.is_aborted();

    match result {
        Ok(()) => {
            progress.set(HandshakePhase::Complete);
            let session = progress.snapshot();
            info!("{:?} handshake complete with {}", session.role, session.peer_address);
            Ok(session)
        }
        Err(e) => {
            progress.set(HandshakePhase::Failed);
            let e = if aborted { HandshakeError::Aborted } else { e };
            warn!("Key handshake failed: {}", e);
            Err(e)
        }
    }
}

fn connect_and_run(
    adapter: &dyn RfcommAdapter,
    peer: &str,
    token: &str,
    config: &HandshakeConfig,
    progress: &Progress,
    abort: &AbortHandle,
) -> Result<(), HandshakeError> {
    if abort.is_aborted() {
        return Err(HandshakeError::Aborted);
    }
    // Bounded so an unreachable peer cannot outlast an abort indefinitely
    let stream = adapter.connect(peer, config.service_uuid, config.read_timeout)?;
    abort.register(stream.shutdown_handle()?)?;
    initiate(stream, token, config, progress)
}

/// Initiator side over an already connected stream.
fn initiate(
    stream: Box<dyn RfcommStream>,
    token: &str,
    config: &HandshakeConfig,
    progress: &Progress,
) -> Result<(), HandshakeError> {
    stream.set_read_timeout(config.read_timeout)?;
    let mut lines = LineStream::new(stream);
    progress.set(HandshakePhase::Connected);

    lines.send(token)?;
    progress.set(HandshakePhase::AwaitingGet);

    let response = lines.receive()?;
    debug!("Server response: {:?}", response);
    if response != GET {
        return Err(HandshakeError::UnexpectedMessage {
            expected: GET.to_string(),
            received: response,
        });
    }
    progress.set(HandshakePhase::SendDone);

    lines.send(DONE)?;
    lines.await_close(config.close_linger);
    Ok(())
}

/// Responder side over an accepted stream.
fn respond<F>(
    stream: Box<dyn RfcommStream>,
    config: &HandshakeConfig,
    progress: &Progress,
    abort: &AbortHandle,
    commit: F,
) -> Result<(), HandshakeError>
where
    F: FnOnce(&HandshakeSession) -> Result<(), String>,
{
    abort.register(stream.shutdown_handle()?)?;
    stream.set_read_timeout(config.read_timeout)?;
    progress.lock().peer_address = stream.peer_address();
    let mut lines = LineStream::new(stream);
    progress.set(HandshakePhase::Connected);

    let token = lines.receive()?;
    debug!("Token: {:?}", token);
    progress.lock().token = token;
    progress.set(HandshakePhase::GotToken);

    lines.send(GET)?;
    progress.set(HandshakePhase::AwaitingDone);

    let response = lines.receive()?;
    debug!("Client response: {:?}", response);
    if response != DONE {
        return Err(HandshakeError::UnexpectedMessage {
            expected: DONE.to_string(),
            received: response,
        });
    }

    commit(&progress.snapshot()).map_err(HandshakeError::Commit)
}

/// Newline-delimited text over a stream socket.
struct LineStream {
    reader: BufReader<Box<dyn RfcommStream>>,
}

impl LineStream {
    fn new(stream: Box<dyn RfcommStream>) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    fn send(&mut self, line: &str) -> Result<(), HandshakeError> {
        let stream = self.reader.get_mut();
        stream
            .write_all(format!("{}\n", line).as_bytes())
            .and_then(|_| stream.flush())
            .map_err(HandshakeError::from_io)
    }

    fn receive(&mut self) -> Result<String, HandshakeError> {
        let mut line = String::new();
        let n = (&mut self.reader)
            .take(MAX_LINE)
            .read_line(&mut line)
            .map_err(HandshakeError::from_io)?;
        if n == 0 {
            return Err(HandshakeError::PeerClosed);
        }
        if !line.ends_with('\n') && n as u64 == MAX_LINE {
            return Err(HandshakeError::UnexpectedMessage {
                expected: "a line".to_string(),
                received: format!("{} bytes without newline", n),
            });
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Wait until the peer hangs up, at most `linger`. Errors are not interesting here.
    fn await_close(&mut self, linger: Duration) {
        if linger.is_zero() {
            return;
        }
        if self.reader.get_ref().set_read_timeout(Some(linger)).is_err() {
            return;
        }
        let mut buf = [0u8; 64];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }
}
