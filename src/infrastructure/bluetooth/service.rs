//! Bluetooth Service Module
//!
//! Main service that coordinates scanning, the peripheral link, the
//! authorization policy and key handoffs for the switch controller.

use crate::domain::authorization::AuthorizationStore;
use crate::domain::controller::PeripheralController;
use crate::domain::models::{
    AppEvent, BdAddr, DeviceIdentity, HandshakeSession, KeyExchangeOutcome, LinkEvent, LinkState,
    MessageSeverity, PeripheralState, ProtocolMessage, ScanEvent, StatusMessage,
};
use crate::domain::settings::{BleSettings, Settings};
use crate::error::{GattError, HandshakeError};
use crate::infrastructure::bluetooth::{
    connection::{GattLink, LinkConfig},
    scanner::{AutoConnectPolicy, ScanSession},
    transport::{BleScanner, GattTransport},
};
use crate::infrastructure::rfcomm::{
    spawn_initiator, spawn_responder, AbortHandle, HandshakeConfig, HandshakeHandle, RfcommAdapter,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mark the address received through a key handoff as authorized.
pub fn commit_received_key(store: &AuthorizationStore, session: &HandshakeSession) -> Result<(), String> {
    let address = BdAddr::parse(&session.token).map_err(|e| e.to_string())?;
    store
        .set_authorized(address.as_str())
        .map_err(|e| e.to_string())?;
    info!("Stored key for {} received from {}", address, session.peer_address);
    Ok(())
}

/// The current peripheral connection and its policy state.
struct LinkSlot {
    link: Arc<GattLink>,
    controller: Arc<Mutex<PeripheralController>>,
}

struct Core {
    transport: Arc<dyn GattTransport>,
    rfcomm: Arc<dyn RfcommAdapter>,
    scan: ScanSession,
    store: AuthorizationStore,
    ble: BleSettings,
    key_exchange: HandshakeConfig,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    link: Mutex<Option<LinkSlot>>,
    handshakes: Mutex<Vec<AbortHandle>>,
}

impl Core {
    fn status(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.into(),
            severity,
        }));
    }

    fn connect(&self, address: &str) -> Result<(), GattError> {
        let address = BdAddr::parse(address)?;
        let mut slot = lock(&self.link);

        if let Some(current) = slot.as_ref() {
            if current.link.state().is_active() {
                // No-op for the same address, LinkBusy otherwise
                return current.link.connect(address.as_str());
            }
        }
        // The previous link is closed before a new one is opened
        drop(slot.take());

        let link = Arc::new(GattLink::new(
            self.transport.clone(),
            LinkConfig {
                service_uuid: self.ble.service_uuid,
                characteristic_uuid: self.ble.characteristic_uuid,
            },
        ));
        let controller = Arc::new(Mutex::new(PeripheralController::new(
            address.as_str(),
            self.store.clone(),
        )));

        tokio::spawn(drive_link(
            Arc::downgrade(&link),
            controller.clone(),
            link.subscribe(),
            self.event_sender.clone(),
        ));

        link.connect(address.as_str())?;
        *slot = Some(LinkSlot { link, controller });
        Ok(())
    }
}

/// Main service coordinating all Bluetooth operations.
///
/// Must be created inside a tokio runtime; its methods spawn tasks on it.
pub struct BluetoothService {
    core: Arc<Core>,
    scan_task: JoinHandle<()>,
}

impl BluetoothService {
    /// Create a new Bluetooth service on top of the platform capabilities.
    pub fn new(
        transport: Arc<dyn GattTransport>,
        scanner: Arc<dyn BleScanner>,
        rfcomm: Arc<dyn RfcommAdapter>,
        store: AuthorizationStore,
        settings: &Settings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let scan = ScanSession::new(scanner);
        let scan_events = scan.subscribe();
        let policy = AutoConnectPolicy::new(
            settings.ble.auto_connect,
            settings.ble.auto_connect_name.clone(),
        );

        let core = Arc::new(Core {
            transport,
            rfcomm,
            scan,
            store,
            ble: settings.ble.clone(),
            key_exchange: HandshakeConfig::from(&settings.key_exchange),
            event_sender,
            link: Mutex::new(None),
            handshakes: Mutex::new(Vec::new()),
        });

        let scan_task = tokio::spawn(forward_scan_events(Arc::downgrade(&core), scan_events, policy));
        Self { core, scan_task }
    }

    /// Start scanning for the configured scan period
    pub fn start_scan(&self) -> Result<(), GattError> {
        let period = self.core.ble.scan_period();
        if let Err(e) = self.core.scan.start(period) {
            self.core
                .status(format!("Scan failed: {}", e), MessageSeverity::Error);
            return Err(e);
        }
        self.core.status("Scanning...", MessageSeverity::Info);
        Ok(())
    }

    /// Stop scanning
    pub fn stop_scan(&self) {
        self.core.scan.stop();
    }

    pub fn is_scanning(&self) -> bool {
        self.core.scan.is_scanning()
    }

    /// Devices discovered by the current or last scan
    pub fn devices(&self) -> Vec<DeviceIdentity> {
        self.core.scan.devices()
    }

    /// Connect to a peripheral by address.
    ///
    /// Notifications are enabled as soon as the switch characteristic has
    /// been discovered; messages from the peripheral are then applied to the
    /// controller state and answered when needed.
    pub fn connect(&self, address: &str) -> Result<(), GattError> {
        self.core.connect(address)
    }

    /// Disconnect from the current peripheral
    pub fn disconnect(&self) {
        if let Some(current) = lock(&self.core.link).as_ref() {
            current.link.disconnect();
        }
    }

    pub fn link_state(&self) -> LinkState {
        lock(&self.core.link)
            .as_ref()
            .map(|s| s.link.state())
            .unwrap_or(LinkState::Disconnected)
    }

    /// Address of the current or last peripheral
    pub fn peripheral_address(&self) -> Option<BdAddr> {
        lock(&self.core.link).as_ref().and_then(|s| s.link.address())
    }

    pub fn peripheral_state(&self) -> Option<PeripheralState> {
        lock(&self.core.link)
            .as_ref()
            .map(|s| lock(&s.controller).state())
    }

    /// Switch the peripheral's output. Requires the peripheral to have enabled control.
    pub fn set_output(&self, on: bool) -> Result<(), GattError> {
        let slot = lock(&self.core.link);
        let current = slot
            .as_ref()
            .ok_or(GattError::NotReady(LinkState::Disconnected))?;
        let command = lock(&current.controller).output_command(on)?;
        current.link.write(&command)
    }

    /// Ask the peripheral for its current value
    pub fn read(&self) -> Result<(), GattError> {
        let slot = lock(&self.core.link);
        let current = slot
            .as_ref()
            .ok_or(GattError::NotReady(LinkState::Disconnected))?;
        current.link.read()
    }

    /// Hand the current peripheral's key to the controller at `peer`.
    pub fn give_key(&self, peer: &str) -> Result<(), HandshakeError> {
        let token = self
            .peripheral_address()
            .ok_or(HandshakeError::NoPeripheral)?;
        info!("Giving key for {} to {}", token, peer);

        let handle = spawn_initiator(
            self.core.rfcomm.clone(),
            peer,
            token.as_str(),
            self.core.key_exchange.clone(),
        )?;
        self.track(handle);
        Ok(())
    }

    /// Wait for one key handoff from another controller.
    ///
    /// Returns the address being listened on. The received peripheral
    /// address is stored as authorized once the peer confirms.
    pub fn receive_key(&self) -> Result<String, HandshakeError> {
        let config = self.core.key_exchange.clone();
        let listener = self
            .core
            .rfcomm
            .listen(&config.service_name, config.service_uuid)?;
        let local = listener.local_address();

        let store = self.core.store.clone();
        let handle = spawn_responder(listener, config, move |session| {
            commit_received_key(&store, session)
        })?;
        self.track(handle);

        self.core
            .status(format!("Waiting for a key on {}", local), MessageSeverity::Info);
        Ok(local)
    }

    /// Abort every running key handoff
    pub fn abort_key_exchange(&self) {
        let handshakes = std::mem::take(&mut *lock(&self.core.handshakes));
        for handshake in handshakes {
            handshake.abort();
        }
    }

    fn track(&self, handle: HandshakeHandle) {
        {
            let mut handshakes = lock(&self.core.handshakes);
            handshakes.retain(|h| !h.is_finished());
            handshakes.push(handle.abort_handle());
        }

        let sender = self.core.event_sender.clone();
        tokio::task::spawn_blocking(move || {
            let role = handle.role();
            let outcome = match handle.join() {
                Ok(session) => KeyExchangeOutcome::Completed(session),
                Err(error) => KeyExchangeOutcome::Failed { role, error },
            };
            let _ = sender.send(AppEvent::KeyExchange(outcome));
        });
    }
}

impl Drop for BluetoothService {
    fn drop(&mut self) {
        self.abort_key_exchange();
        self.scan_task.abort();
        self.core.scan.stop();
        if let Some(current) = lock(&self.core.link).take() {
            current.link.close();
        }
    }
}

async fn forward_scan_events(
    core: Weak<Core>,
    mut events: mpsc::UnboundedReceiver<ScanEvent>,
    policy: AutoConnectPolicy,
) {
    while let Some(event) = events.recv().await {
        let Some(core) = core.upgrade() else {
            break;
        };

        let matched = policy.apply(&core.scan, &event);
        let _ = core.event_sender.send(AppEvent::Scan(event));

        if let Some(device) = matched {
            if let Err(e) = core.connect(&device.address) {
                warn!("Auto-connect to {} failed: {}", device.address, e);
                core.status(
                    format!("Could not connect to {}: {}", device.display_name(), e),
                    MessageSeverity::Error,
                );
            }
        }
    }
}

async fn drive_link(
    link: Weak<GattLink>,
    controller: Arc<Mutex<PeripheralController>>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    sender: mpsc::UnboundedSender<AppEvent>,
) {
    while let Some(event) = events.recv().await {
        let message = match &event {
            LinkEvent::ServicesDiscovered {
                characteristic: Some(_),
            } => {
                if let Some(link) = link.upgrade() {
                    if let Err(e) = link.set_notifications(true) {
                        warn!("Could not enable notifications: {}", e);
                    }
                }
                None
            }
            LinkEvent::DataAvailable(message) => Some(message.clone()),
            _ => None,
        };

        let _ = sender.send(AppEvent::Link(event));

        if let Some(message) = message {
            apply_message(&link, &controller, &message, &sender);
        }
    }
}

fn apply_message(
    link: &Weak<GattLink>,
    controller: &Mutex<PeripheralController>,
    message: &ProtocolMessage,
    sender: &mpsc::UnboundedSender<AppEvent>,
) {
    let (reply, state) = {
        let mut controller = lock(controller);
        match controller.handle(message) {
            Ok(reply) => (reply, controller.state()),
            Err(e) => {
                error!("Failed to store authorization: {}", e);
                let _ = sender.send(AppEvent::LogMessage(StatusMessage {
                    message: format!("Failed to store authorization: {}", e),
                    severity: MessageSeverity::Error,
                }));
                return;
            }
        }
    };

    if *message == ProtocolMessage::Auth {
        let _ = sender.send(AppEvent::LogMessage(StatusMessage {
            message: "Authorized".to_string(),
            severity: MessageSeverity::Success,
        }));
    }
    let _ = sender.send(AppEvent::Peripheral(state));

    if let Some(reply) = reply {
        if let Some(link) = link.upgrade() {
            if let Err(e) = link.write(&reply) {
                warn!("Failed to answer {:?}: {}", message, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::HandshakeRole;
    use crate::infrastructure::bluetooth::mock::{MockScanner, MockTransport};
    use crate::infrastructure::bluetooth::transport::TransportEvent;
    use crate::infrastructure::rfcomm::TcpRfcomm;
    use std::time::Duration;
    use tokio::time::timeout;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    struct Fixture {
        service: BluetoothService,
        transport: Arc<MockTransport>,
        scanner: Arc<MockScanner>,
        store: AuthorizationStore,
        events: mpsc::UnboundedReceiver<AppEvent>,
    }

    fn fixture(settings: Settings) -> Fixture {
        let transport = Arc::new(MockTransport::responsive());
        let scanner = Arc::new(MockScanner::new());
        let store = AuthorizationStore::in_memory();
        let (tx, events) = mpsc::unbounded_channel();
        let service = BluetoothService::new(
            transport.clone(),
            scanner.clone(),
            Arc::new(TcpRfcomm::new("127.0.0.1:0")),
            store.clone(),
            &settings,
            tx,
        );
        Fixture {
            service,
            transport,
            scanner,
            store,
            events,
        }
    }

    /// Skip events until `pred` matches one.
    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<AppEvent>,
        pred: impl Fn(&AppEvent) -> bool,
    ) -> AppEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn subscribed(f: &mut Fixture) {
        f.service.connect(ADDR).unwrap();
        wait_for(&mut f.events, |e| matches!(e, AppEvent::Link(LinkEvent::Subscribed))).await;
    }

    #[tokio::test]
    async fn test_connect_enables_notifications() {
        let mut f = fixture(Settings::default());
        subscribed(&mut f).await;
        assert_eq!(f.service.link_state(), LinkState::Subscribed);
        assert_eq!(f.service.peripheral_address().unwrap().as_str(), ADDR);
    }

    #[tokio::test]
    async fn test_output_requires_authorization() {
        let mut f = fixture(Settings::default());
        subscribed(&mut f).await;

        assert_eq!(f.service.set_output(true), Err(GattError::Unauthorized));

        f.transport
            .emit(TransportEvent::CharacteristicChanged(b"Auth".to_vec()));
        wait_for(&mut f.events, |e| {
            matches!(e, AppEvent::Peripheral(s) if s.control_enabled)
        })
        .await;

        assert!(f.store.is_authorized(ADDR));
        f.service.set_output(true).unwrap();
        assert_eq!(f.transport.written().last().unwrap(), b"On");
    }

    #[tokio::test]
    async fn test_query_is_answered_when_authorized() {
        let mut f = fixture(Settings::default());
        f.store.set_authorized(ADDR).unwrap();
        subscribed(&mut f).await;

        f.transport
            .emit(TransportEvent::CharacteristicChanged(b"?".to_vec()));
        wait_for(&mut f.events, |e| matches!(e, AppEvent::Peripheral(_))).await;

        assert_eq!(f.transport.written(), vec![b"Auth".to_vec()]);
    }

    #[tokio::test]
    async fn test_auto_connect_on_matching_name() {
        let mut settings = Settings::default();
        settings.ble.auto_connect = true;
        let mut f = fixture(settings);

        f.service.start_scan().unwrap();
        f.scanner.advertise(DeviceIdentity::new("11:22:33:44:55:66", "Other"));
        f.scanner.advertise(DeviceIdentity::new(ADDR, "DSSCSA_8"));

        wait_for(&mut f.events, |e| matches!(e, AppEvent::Link(LinkEvent::Subscribed))).await;
        assert!(!f.service.is_scanning());
        assert_eq!(f.transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_give_key_requires_peripheral() {
        let f = fixture(Settings::default());
        assert!(matches!(
            f.service.give_key("127.0.0.1:1"),
            Err(HandshakeError::NoPeripheral)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_key_handoff_between_services() {
        let mut receiver = fixture(Settings::default());
        let local = receiver.service.receive_key().unwrap();

        let mut giver = fixture(Settings::default());
        subscribed(&mut giver).await;
        giver.service.give_key(&local).unwrap();

        let outcome = wait_for(&mut receiver.events, |e| matches!(e, AppEvent::KeyExchange(_))).await;
        match outcome {
            AppEvent::KeyExchange(KeyExchangeOutcome::Completed(session)) => {
                assert_eq!(session.role, HandshakeRole::Responder);
                assert_eq!(session.token, ADDR);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(receiver.store.is_authorized(ADDR));

        let outcome = wait_for(&mut giver.events, |e| matches!(e, AppEvent::KeyExchange(_))).await;
        assert!(matches!(
            outcome,
            AppEvent::KeyExchange(KeyExchangeOutcome::Completed(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_stops_listening() {
        let mut f = fixture(Settings::default());
        f.service.receive_key().unwrap();
        f.service.abort_key_exchange();

        let outcome = wait_for(&mut f.events, |e| matches!(e, AppEvent::KeyExchange(_))).await;
        assert!(matches!(
            outcome,
            AppEvent::KeyExchange(KeyExchangeOutcome::Failed {
                error: HandshakeError::Aborted,
                ..
            })
        ));
    }

    #[test]
    fn test_commit_rejects_non_address_token() {
        let store = AuthorizationStore::in_memory();
        let session = HandshakeSession {
            role: HandshakeRole::Responder,
            peer_address: "peer".to_string(),
            token: "not an address".to_string(),
            phase: crate::domain::models::HandshakePhase::AwaitingDone,
        };
        assert!(commit_received_key(&store, &session).is_err());
        assert!(!store.is_authorized("not an address"));
    }
}
