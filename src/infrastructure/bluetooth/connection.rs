//! BLE Connection Module
//!
//! [`GattLink`] owns the state machine of one peripheral connection:
//!
//! ```text
//! Disconnected --connect--> Connecting --link up--> Connected --discovery ok--> ServicesDiscovered
//!                                |                      |                             |
//!                           link failed          discovery failed             notifications on
//!                                v                      v                             v
//!                             Failed                 Failed                       Subscribed
//! any state --remote drop / disconnect / close--> Disconnected
//! ```
//!
//! Platform callbacks only enqueue [`TransportEvent`]s; a single driver task
//! applies them one at a time, so transitions are totally ordered.

use crate::domain::models::{BdAddr, CharacteristicRef, FailureReason, LinkEvent, LinkState, ProtocolMessage};
use crate::error::GattError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportEvent, TransportSink};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Service UUID to look for
    pub service_uuid: Uuid,
    /// Switch characteristic UUID
    pub characteristic_uuid: Uuid,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID,
            characteristic_uuid: protocol::CHARACTERISTIC_UUID,
        }
    }
}

struct LinkInner {
    state: LinkState,
    address: Option<BdAddr>,
    /// Incremented on every connect/disconnect; events tagged with an older value are stale
    attempt: u64,
    characteristic: Option<CharacteristicRef>,
    /// Set while a `Disconnected` event is owed to subscribers
    disconnect_pending: bool,
    closed: bool,
    subscribers: Vec<mpsc::UnboundedSender<LinkEvent>>,
}

struct Shared {
    transport: Arc<dyn GattTransport>,
    config: LinkConfig,
    inner: Mutex<LinkInner>,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

/// One GATT connection attempt and its lifecycle.
///
/// Owned by whoever called [`connect`](Self::connect); dropping it closes the
/// link. Must be created inside a tokio runtime.
pub struct GattLink {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl GattLink {
    pub fn new(transport: Arc<dyn GattTransport>, config: LinkConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            transport,
            config,
            inner: Mutex::new(LinkInner {
                state: LinkState::Disconnected,
                address: None,
                attempt: 0,
                characteristic: None,
                disconnect_pending: false,
                closed: false,
                subscribers: Vec::new(),
            }),
            events_tx,
        });

        let driver = tokio::spawn(drive(Arc::downgrade(&shared), events_rx));
        Self { shared, driver }
    }

    /// Register for lifecycle and data events.
    ///
    /// Events are delivered in the order the transport reported them.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LinkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().subscribers.push(tx);
        rx
    }

    pub fn state(&self) -> LinkState {
        self.shared.lock().state.clone()
    }

    pub fn address(&self) -> Option<BdAddr> {
        self.shared.lock().address.clone()
    }

    /// The resolved switch characteristic, once services are discovered.
    pub fn characteristic(&self) -> Option<CharacteristicRef> {
        self.shared.lock().characteristic.clone()
    }

    /// Open a link to `address`.
    ///
    /// Returns immediately; progress is reported through [`subscribe`](Self::subscribe).
    /// Calling it again for the address already being connected is a no-op.
    pub fn connect(&self, address: &str) -> Result<(), GattError> {
        let shared: &Shared = &self.shared;
        let mut inner = shared.lock();

        if inner.closed {
            return Err(GattError::LinkClosed);
        }

        let address = BdAddr::parse(address)?;

        if !shared.transport.adapter_available() {
            warn!("Bluetooth adapter not available");
            return Err(GattError::AdapterUnavailable);
        }

        if inner.state.is_active() {
            return match &inner.address {
                Some(current) if *current == address => {
                    debug!("Link to {} already {}", address, inner.state);
                    Ok(())
                }
                Some(current) => Err(GattError::LinkBusy {
                    current: current.to_string(),
                }),
                None => Err(GattError::LinkBusy {
                    current: String::new(),
                }),
            };
        }

        inner.attempt += 1;
        inner.state = LinkState::Connecting;
        inner.address = Some(address.clone());
        inner.characteristic = None;
        inner.disconnect_pending = true;

        info!("Connecting to {}", address);
        let sink = TransportSink::new(inner.attempt, shared.events_tx.clone());
        if let Err(e) = shared.transport.open(&address, sink) {
            warn!("Failed to open link to {}: {}", address, e);
            let reason = FailureReason::LinkFailed(e.to_string());
            inner.state = LinkState::Failed(reason.clone());
            inner.disconnect_pending = false;
            inner.emit(LinkEvent::Failed(reason));
            return Err(e);
        }

        Ok(())
    }

    /// Write a message to the switch characteristic.
    pub fn write(&self, message: &ProtocolMessage) -> Result<(), GattError> {
        let value = protocol::encode(message);
        self.with_characteristic(|shared, service, characteristic| {
            shared.transport.write(service, characteristic, &value)
        })?;

        if let Some(c) = self.shared.lock().characteristic.as_mut() {
            c.last_value = message.to_string();
        }
        debug!("Wrote {:?}", message);
        Ok(())
    }

    /// Request a read; the value arrives as [`LinkEvent::DataAvailable`].
    pub fn read(&self) -> Result<(), GattError> {
        self.with_characteristic(|shared, service, characteristic| {
            shared.transport.read(service, characteristic)
        })
    }

    /// Enable or disable change notifications on the switch characteristic.
    pub fn set_notifications(&self, enabled: bool) -> Result<(), GattError> {
        self.with_characteristic(|shared, service, characteristic| {
            shared.transport.set_notifications(service, characteristic, enabled)
        })
    }

    /// Drop the current link. The instance can connect again afterwards.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        if inner.state == LinkState::Disconnected && !inner.disconnect_pending {
            return;
        }
        info!("Disconnecting");
        // Late events from the dropped link must not be applied
        inner.attempt += 1;
        self.shared.teardown(&mut inner);
    }

    /// Close the link for good. Further `connect` calls fail with `LinkClosed`.
    pub fn close(&self) {
        let mut inner = self.shared.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.attempt += 1;
        self.shared.teardown(&mut inner);
        debug!("Link closed");
    }

    fn with_characteristic<F>(&self, op: F) -> Result<(), GattError>
    where
        F: FnOnce(&Shared, Uuid, Uuid) -> Result<(), GattError>,
    {
        let shared: &Shared = &self.shared;
        let mut inner = shared.lock();

        if !inner.state.is_ready() {
            return Err(GattError::NotReady(inner.state.clone()));
        }

        let (service, characteristic) = match &inner.characteristic {
            Some(c) => (c.service_id, c.characteristic_id),
            None => {
                return Err(GattError::CharacteristicNotFound {
                    service: shared.config.service_uuid,
                    characteristic: shared.config.characteristic_uuid,
                })
            }
        };

        match op(shared, service, characteristic) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Characteristic I/O failed: {}", e);
                inner.attempt += 1;
                shared.teardown(&mut inner);
                Err(match e {
                    GattError::TransportDisconnected(reason) => {
                        GattError::TransportDisconnected(reason)
                    }
                    other => GattError::TransportDisconnected(other.to_string()),
                })
            }
        }
    }
}

impl Drop for GattLink {
    fn drop(&mut self) {
        self.close();
        self.driver.abort();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one transport event. Runs on the driver task only.
    fn handle(&self, attempt: u64, event: TransportEvent) {
        let mut inner = self.lock();

        if inner.closed || attempt != inner.attempt {
            trace!("Dropping stale event {:?} (attempt {})", event, attempt);
            return;
        }

        let state = inner.state.clone();
        match (state, event) {
            (LinkState::Connecting, TransportEvent::LinkUp) => {
                inner.state = LinkState::Connected;
                let address = inner.address.clone();
                if let Some(address) = address {
                    info!("GATT server connected: {}", address);
                    inner.emit(LinkEvent::Connected { address });
                }

                info!("Start discovering GATT services");
                if let Err(e) = self.transport.discover_services() {
                    warn!("Could not start service discovery: {}", e);
                    self.fail(&mut inner, FailureReason::ServiceDiscoveryFailed);
                }
            }
            (LinkState::Connecting, TransportEvent::LinkFailed(reason)) => {
                warn!("Link failed: {}", reason);
                self.fail(&mut inner, FailureReason::LinkFailed(reason));
            }
            (LinkState::Connected, TransportEvent::ServicesDiscovered { success: true }) => {
                inner.state = LinkState::ServicesDiscovered;
                let service = self.config.service_uuid;
                let characteristic = self.config.characteristic_uuid;

                inner.characteristic = if self.transport.resolve_characteristic(service, characteristic) {
                    info!("GATT services discovered, characteristic {} found", characteristic);
                    Some(CharacteristicRef {
                        service_id: service,
                        characteristic_id: characteristic,
                        last_value: String::new(),
                    })
                } else {
                    warn!("Service {} / characteristic {} not found", service, characteristic);
                    None
                };

                let characteristic = inner.characteristic.clone();
                inner.emit(LinkEvent::ServicesDiscovered { characteristic });
            }
            (LinkState::Connected, TransportEvent::ServicesDiscovered { success: false }) => {
                warn!("Service discovery failed");
                self.fail(&mut inner, FailureReason::ServiceDiscoveryFailed);
            }
            (
                LinkState::ServicesDiscovered | LinkState::Subscribed,
                TransportEvent::CharacteristicChanged(value) | TransportEvent::CharacteristicRead(value),
            ) => {
                let message = protocol::decode(&value);
                if let Some(c) = inner.characteristic.as_mut() {
                    c.last_value = message.to_string();
                }
                debug!("Data available: {:?}", message);
                inner.emit(LinkEvent::DataAvailable(message));
            }
            (LinkState::ServicesDiscovered, TransportEvent::NotificationsChanged { enabled: true, success: true }) => {
                inner.state = LinkState::Subscribed;
                info!("Notifications enabled");
                inner.emit(LinkEvent::Subscribed);
            }
            (LinkState::Subscribed, TransportEvent::NotificationsChanged { enabled: false, success: true }) => {
                inner.state = LinkState::ServicesDiscovered;
                info!("Notifications disabled");
            }
            (_, TransportEvent::NotificationsChanged { enabled, success: false }) => {
                warn!("Changing notifications to {} failed", enabled);
            }
            (LinkState::Failed(_), TransportEvent::LinkDown) => {
                trace!("Link down after failure");
            }
            (_, TransportEvent::LinkDown) => {
                info!("GATT server disconnected");
                self.teardown(&mut inner);
            }
            (state, event) => {
                debug!("Ignoring {:?} in state {}", event, state);
            }
        }
    }

    fn fail(&self, inner: &mut LinkInner, reason: FailureReason) {
        self.transport.close();
        inner.state = LinkState::Failed(reason.clone());
        inner.characteristic = None;
        inner.disconnect_pending = false;
        inner.emit(LinkEvent::Failed(reason));
    }

    /// Release the platform link and report `Disconnected` if it is still owed.
    fn teardown(&self, inner: &mut LinkInner) {
        self.transport.close();
        inner.state = LinkState::Disconnected;
        inner.characteristic = None;
        if inner.disconnect_pending {
            inner.disconnect_pending = false;
            inner.emit(LinkEvent::Disconnected);
        }
    }
}

impl LinkInner {
    fn emit(&mut self, event: LinkEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

async fn drive(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<(u64, TransportEvent)>) {
    while let Some((attempt, event)) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.handle(attempt, event);
    }
    trace!("Link driver finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{MockTransport, TransportCall};
    use std::time::Duration;
    use tokio::time::timeout;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    async fn next(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for link event")
            .expect("link event channel closed")
    }

    fn new_link(transport: &Arc<MockTransport>) -> GattLink {
        GattLink::new(transport.clone(), LinkConfig::default())
    }

    #[tokio::test]
    async fn test_connect_auto_discovers_services() {
        let transport = Arc::new(MockTransport::new());
        let link = new_link(&transport);
        let mut events = link.subscribe();

        link.connect(ADDR).unwrap();
        assert_eq!(link.state(), LinkState::Connecting);

        transport.emit(TransportEvent::LinkUp);
        assert!(matches!(next(&mut events).await, LinkEvent::Connected { .. }));
        assert!(transport.calls().contains(&TransportCall::DiscoverServices));

        transport.emit(TransportEvent::ServicesDiscovered { success: true });
        match next(&mut events).await {
            LinkEvent::ServicesDiscovered { characteristic: Some(c) } => {
                assert_eq!(c.characteristic_id, protocol::CHARACTERISTIC_UUID);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(link.state(), LinkState::ServicesDiscovered);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let link = new_link(&transport);

        link.connect(ADDR).unwrap();
        link.connect(ADDR).unwrap();
        assert_eq!(transport.open_count(), 1);

        assert!(matches!(
            link.connect("11:22:33:44:55:66"),
            Err(GattError::LinkBusy { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_validates_address_and_adapter() {
        let transport = Arc::new(MockTransport::new());
        let link = new_link(&transport);
        assert_eq!(
            link.connect("not-an-address"),
            Err(GattError::InvalidAddress("not-an-address".to_string()))
        );

        let transport = Arc::new(MockTransport::without_adapter());
        let link = new_link(&transport);
        assert_eq!(link.connect(ADDR), Err(GattError::AdapterUnavailable));
        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test]
    async fn test_link_failure_allows_fresh_attempt() {
        let transport = Arc::new(MockTransport::new());
        let link = new_link(&transport);
        let mut events = link.subscribe();

        link.connect(ADDR).unwrap();
        transport.emit(TransportEvent::LinkFailed("peer unreachable".to_string()));
        let reason = FailureReason::LinkFailed("peer unreachable".to_string());
        assert_eq!(next(&mut events).await, LinkEvent::Failed(reason.clone()));
        assert_eq!(link.state(), LinkState::Failed(reason));
        assert!(transport.calls().contains(&TransportCall::Close));

        link.connect(ADDR).unwrap();
        assert_eq!(transport.open_count(), 2);
        assert_eq!(link.state(), LinkState::Connecting);
        transport.emit(TransportEvent::LinkUp);
        assert!(matches!(next(&mut events).await, LinkEvent::Connected { .. }));
    }

    #[tokio::test]
    async fn test_refused_open_fails_link() {
        let transport = Arc::new(MockTransport::new());
        let link = new_link(&transport);
        let mut events = link.subscribe();

        transport.set_fail_open(true);
        assert!(matches!(
            link.connect(ADDR),
            Err(GattError::TransportDisconnected(_))
        ));
        assert!(matches!(
            next(&mut events).await,
            LinkEvent::Failed(FailureReason::LinkFailed(_))
        ));
        assert!(matches!(link.state(), LinkState::Failed(FailureReason::LinkFailed(_))));

        transport.set_fail_open(false);
        link.connect(ADDR).unwrap();
        assert_eq!(transport.open_count(), 2);
        assert_eq!(link.state(), LinkState::Connecting);
    }

    #[tokio::test]
    async fn test_io_before_ready_is_rejected() {
        let transport = Arc::new(MockTransport::new());
        let link = new_link(&transport);

        assert_eq!(
            link.write(&ProtocolMessage::On),
            Err(GattError::NotReady(LinkState::Disconnected))
        );

        link.connect(ADDR).unwrap();
        assert_eq!(link.read(), Err(GattError::NotReady(LinkState::Connecting)));
        assert_eq!(
            link.set_notifications(true),
            Err(GattError::NotReady(LinkState::Connecting))
        );
    }

    #[tokio::test]
    async fn test_missing_characteristic_is_reported() {
        let transport = Arc::new(MockTransport::without_characteristic());
        let link = new_link(&transport);
        let mut events = link.subscribe();

        link.connect(ADDR).unwrap();
        transport.emit(TransportEvent::LinkUp);
        transport.emit(TransportEvent::ServicesDiscovered { success: true });
        next(&mut events).await;
        assert_eq!(
            next(&mut events).await,
            LinkEvent::ServicesDiscovered { characteristic: None }
        );

        assert_eq!(link.state(), LinkState::ServicesDiscovered);
        assert!(matches!(
            link.write(&ProtocolMessage::On),
            Err(GattError::CharacteristicNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_discovery_failure_fails_link() {
        let transport = Arc::new(MockTransport::new());
        let link = new_link(&transport);
        let mut events = link.subscribe();

        link.connect(ADDR).unwrap();
        transport.emit(TransportEvent::LinkUp);
        transport.emit(TransportEvent::ServicesDiscovered { success: false });
        next(&mut events).await;

        assert_eq!(
            next(&mut events).await,
            LinkEvent::Failed(FailureReason::ServiceDiscoveryFailed)
        );
        assert_eq!(
            link.state(),
            LinkState::Failed(FailureReason::ServiceDiscoveryFailed)
        );
        assert!(transport.calls().contains(&TransportCall::Close));
    }

    #[tokio::test]
    async fn test_subscribe_and_data_in_order() {
        let transport = Arc::new(MockTransport::new());
        let link = new_link(&transport);
        let mut events = link.subscribe();

        link.connect(ADDR).unwrap();
        transport.emit(TransportEvent::LinkUp);
        transport.emit(TransportEvent::ServicesDiscovered { success: true });
        next(&mut events).await;
        next(&mut events).await;

        link.set_notifications(true).unwrap();
        transport.emit(TransportEvent::NotificationsChanged { enabled: true, success: true });
        assert_eq!(next(&mut events).await, LinkEvent::Subscribed);
        assert_eq!(link.state(), LinkState::Subscribed);

        transport.emit(TransportEvent::CharacteristicChanged(b"Ready".to_vec()));
        transport.emit(TransportEvent::CharacteristicChanged(b"On".to_vec()));
        transport.emit(TransportEvent::CharacteristicRead(b"O".to_vec()));
        assert_eq!(next(&mut events).await, LinkEvent::DataAvailable(ProtocolMessage::Ready));
        assert_eq!(next(&mut events).await, LinkEvent::DataAvailable(ProtocolMessage::On));
        assert_eq!(
            next(&mut events).await,
            LinkEvent::DataAvailable(ProtocolMessage::Unknown("O".to_string()))
        );
        assert_eq!(link.characteristic().unwrap().last_value, "O");
    }

    #[tokio::test]
    async fn test_disconnect_reported_once() {
        let transport = Arc::new(MockTransport::new());
        let link = new_link(&transport);
        let mut events = link.subscribe();

        link.connect(ADDR).unwrap();
        transport.emit(TransportEvent::LinkUp);
        next(&mut events).await;

        transport.emit(TransportEvent::LinkDown);
        assert_eq!(next(&mut events).await, LinkEvent::Disconnected);
        link.disconnect();
        link.close();
        transport.emit(TransportEvent::LinkDown);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let transport = Arc::new(MockTransport::new());
        let link = new_link(&transport);
        let mut events = link.subscribe();

        link.connect(ADDR).unwrap();
        link.close();
        assert_eq!(next(&mut events).await, LinkEvent::Disconnected);
        assert_eq!(link.connect(ADDR), Err(GattError::LinkClosed));

        // A late callback for the closed attempt changes nothing
        transport.emit(TransportEvent::LinkUp);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_write_failure_disconnects() {
        let transport = Arc::new(MockTransport::new());
        let link = new_link(&transport);
        let mut events = link.subscribe();

        link.connect(ADDR).unwrap();
        transport.emit(TransportEvent::LinkUp);
        transport.emit(TransportEvent::ServicesDiscovered { success: true });
        next(&mut events).await;
        next(&mut events).await;

        transport.set_fail_io(true);
        assert!(matches!(
            link.write(&ProtocolMessage::Off),
            Err(GattError::TransportDisconnected(_))
        ));
        assert_eq!(next(&mut events).await, LinkEvent::Disconnected);
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_after_remote_drop() {
        let transport = Arc::new(MockTransport::new());
        let link = new_link(&transport);
        let mut events = link.subscribe();

        link.connect(ADDR).unwrap();
        transport.emit(TransportEvent::LinkUp);
        next(&mut events).await;
        transport.emit(TransportEvent::LinkDown);
        assert_eq!(next(&mut events).await, LinkEvent::Disconnected);

        link.connect(ADDR).unwrap();
        assert_eq!(transport.open_count(), 2);
        transport.emit(TransportEvent::LinkUp);
        assert!(matches!(next(&mut events).await, LinkEvent::Connected { .. }));
    }
}
