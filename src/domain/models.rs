use crate::error::{GattError, HandshakeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A Bluetooth hardware address in canonical `AA:BB:CC:DD:EE:FF` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BdAddr(String);

impl BdAddr {
    /// Validate a hardware address.
    ///
    /// Accepts exactly six colon separated pairs of uppercase hex digits,
    /// the same rule the platform applies before opening a link.
    pub fn parse(address: &str) -> Result<Self, GattError> {
        let bytes = address.as_bytes();
        if bytes.len() != 17 {
            return Err(GattError::InvalidAddress(address.to_string()));
        }

        for (i, &b) in bytes.iter().enumerate() {
            let ok = if i % 3 == 2 {
                b == b':'
            } else {
                b.is_ascii_digit() || (b'A'..=b'F').contains(&b)
            };
            if !ok {
                return Err(GattError::InvalidAddress(address.to_string()));
            }
        }

        Ok(Self(address.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BdAddr {
    type Err = GattError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BdAddr {
    type Error = GattError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BdAddr> for String {
    fn from(addr: BdAddr) -> Self {
        addr.0
    }
}

/// A device seen during a scan. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub address: String,
    /// Advertised local name, empty when the device did not send one
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }

    /// Name suitable for display, falling back to "Unknown device".
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "Unknown device"
        } else {
            &self.name
        }
    }
}

/// Short text commands exchanged over the switch characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProtocolMessage {
    On,
    Off,
    Auth,
    Ready,
    Query,
    /// Anything outside the vocabulary, kept verbatim
    Unknown(String),
}

impl fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => f.write_str("On"),
            Self::Off => f.write_str("Off"),
            Self::Auth => f.write_str("Auth"),
            Self::Ready => f.write_str("Ready"),
            Self::Query => f.write_str("?"),
            Self::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Why a link ended up in [`LinkState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The platform could not establish the link
    LinkFailed(String),
    ServiceDiscoveryFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkFailed(reason) => write!(f, "link failed: {}", reason),
            Self::ServiceDiscoveryFailed => f.write_str("service discovery failed"),
        }
    }
}

/// Lifecycle of a single GATT link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    ServicesDiscovered,
    Subscribed,
    Failed(FailureReason),
}

impl LinkState {
    /// True once services are resolved, the precondition for characteristic I/O.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::ServicesDiscovered | Self::Subscribed)
    }

    /// True while a link is being opened or is open.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::ServicesDiscovered | Self::Subscribed
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Connecting => f.write_str("Connecting"),
            Self::Connected => f.write_str("Connected"),
            Self::ServicesDiscovered => f.write_str("ServicesDiscovered"),
            Self::Subscribed => f.write_str("Subscribed"),
            Self::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// The resolved switch characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub service_id: Uuid,
    pub characteristic_id: Uuid,
    pub last_value: String,
}

/// Events a [`GattLink`](crate::infrastructure::bluetooth::connection::GattLink)
/// delivers to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { address: BdAddr },
    /// `characteristic` is `None` when the peripheral lacks the switch characteristic
    ServicesDiscovered { characteristic: Option<CharacteristicRef> },
    Subscribed,
    DataAvailable(ProtocolMessage),
    Failed(FailureReason),
    Disconnected,
}

/// Why a scan session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Timeout,
    Requested,
    /// The platform refused to start scanning.
    StartFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Started,
    DeviceFound(DeviceIdentity),
    Stopped(StopReason),
}

/// Which side of the key handoff a controller plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Connects and hands its token over
    Initiator,
    /// Listens and receives a token
    Responder,
}

/// Progress of one handshake. Initiators walk
/// `Idle → Connected → AwaitingGet → SendDone → Complete`; responders walk
/// `Listening → Connected → GotToken → AwaitingDone → Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Idle,
    Listening,
    Connected,
    GotToken,
    AwaitingGet,
    AwaitingDone,
    SendDone,
    Complete,
    Failed,
}

impl HandshakePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Snapshot of one handshake's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeSession {
    pub role: HandshakeRole,
    pub peer_address: String,
    pub token: String,
    pub phase: HandshakePhase,
}

/// What the controller currently knows about the peripheral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeripheralState {
    /// Last reported output, `None` until the peripheral reports one
    pub output: Option<bool>,
    pub authorized: bool,
    pub control_enabled: bool,
}

/// Result of a finished key exchange, as surfaced to the presentation layer.
#[derive(Debug)]
pub enum KeyExchangeOutcome {
    Completed(HandshakeSession),
    Failed {
        role: HandshakeRole,
        error: HandshakeError,
    },
}

#[derive(Debug)]
pub enum AppEvent {
    Scan(ScanEvent),
    Link(LinkEvent),
    Peripheral(PeripheralState),
    KeyExchange(KeyExchangeOutcome),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
