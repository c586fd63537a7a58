//! Platform capabilities
//!
//! The BLE stack is consumed, not implemented. A platform backend implements
//! [`GattTransport`] and [`BleScanner`]; outcomes of its asynchronous requests
//! are pushed back through a [`TransportSink`] from whatever thread the stack
//! delivers callbacks on.

use crate::domain::models::BdAddr;
use crate::error::GattError;
use crate::infrastructure::bluetooth::scanner::DiscoverySink;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Raw outcome reported by the platform for an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LinkUp,
    LinkFailed(String),
    /// Remote drop or local close finished
    LinkDown,
    ServicesDiscovered { success: bool },
    CharacteristicChanged(Vec<u8>),
    CharacteristicRead(Vec<u8>),
    NotificationsChanged { enabled: bool, success: bool },
}

/// Callback handle given to the platform when a link is opened.
///
/// Sending never blocks, so it is safe to call from a stack callback. Each
/// sink is tagged with the link attempt it belongs to; events sent through a
/// sink from an earlier attempt are discarded by the link.
#[derive(Debug, Clone)]
pub struct TransportSink {
    attempt: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportSink {
    pub(crate) fn new(attempt: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { attempt, tx }
    }

    /// Report an event. Returns `false` once the link has been dropped.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.attempt, event)).is_ok()
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }
}

/// GATT client primitives of the platform.
///
/// Every request returns as soon as it has been issued. A synchronous `Err`
/// means the request could not be issued at all.
pub trait GattTransport: Send + Sync {
    /// Whether a powered radio adapter is present.
    fn adapter_available(&self) -> bool;

    /// Start opening a link to `address`; completion arrives as
    /// [`TransportEvent::LinkUp`] or [`TransportEvent::LinkFailed`].
    fn open(&self, address: &BdAddr, sink: TransportSink) -> Result<(), GattError>;

    /// Start service discovery on the open link.
    fn discover_services(&self) -> Result<(), GattError>;

    /// Look up a characteristic among the discovered services.
    fn resolve_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool;

    fn read(&self, service: Uuid, characteristic: Uuid) -> Result<(), GattError>;

    fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<(), GattError>;

    fn set_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), GattError>;

    /// Release the link. Must be safe to call on an already closed link.
    fn close(&self);
}

/// BLE advertisement scanning primitive of the platform.
pub trait BleScanner: Send + Sync {
    /// Begin reporting advertisements to `sink`.
    fn start(&self, sink: DiscoverySink) -> Result<(), GattError>;

    /// Stop reporting. Must be safe to call when not scanning.
    fn stop(&self);
}
