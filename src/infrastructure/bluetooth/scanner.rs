//! BLE Scanner Module
//!
//! Time-boxed device discovery with per-session deduplication.

use crate::domain::models::{DeviceIdentity, ScanEvent, StopReason};
use crate::error::GattError;
use crate::infrastructure::bluetooth::transport::BleScanner;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

#[derive(Default)]
struct ScanInner {
    scanning: bool,
    /// Incremented per `start`; sinks and timers of older sessions are ignored
    generation: u64,
    devices: Vec<DeviceIdentity>,
    seen: HashSet<String>,
    observers: Vec<mpsc::UnboundedSender<ScanEvent>>,
    timer: Option<JoinHandle<()>>,
}

impl ScanInner {
    fn notify(&mut self, event: ScanEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn lock(inner: &Mutex<ScanInner>) -> MutexGuard<'_, ScanInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle the platform scanner reports advertisements through.
///
/// Cheap to clone and safe to call from any callback thread; reports that
/// arrive after the session stopped are dropped.
#[derive(Clone)]
pub struct DiscoverySink {
    generation: u64,
    inner: Arc<Mutex<ScanInner>>,
}

impl DiscoverySink {
    /// Record an advertisement. Returns `true` if the device is new to this session.
    pub fn report(&self, device: DeviceIdentity) -> bool {
        let mut inner = lock(&self.inner);

        if !inner.scanning || inner.generation != self.generation {
            trace!("Late advertisement from {} ignored", device.address);
            return false;
        }

        if !inner.seen.insert(device.address.clone()) {
            return false;
        }

        debug!("Found device {} ({})", device.display_name(), device.address);
        inner.devices.push(device.clone());
        inner.notify(ScanEvent::DeviceFound(device));
        true
    }
}

/// A time-boxed discovery run over BLE advertisements.
pub struct ScanSession {
    scanner: Arc<dyn BleScanner>,
    inner: Arc<Mutex<ScanInner>>,
}

impl ScanSession {
    pub fn new(scanner: Arc<dyn BleScanner>) -> Self {
        Self {
            scanner,
            inner: Arc::new(Mutex::new(ScanInner::default())),
        }
    }

    /// Register for scan events. Observers see devices as they are found.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ScanEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner).observers.push(tx);
        rx
    }

    /// Start scanning for BLE devices
    ///
    /// Any running scan is stopped first and the discovered set is cleared.
    /// The scan stops by itself once `duration` elapses. Must be called
    /// inside a tokio runtime.
    pub fn start(&self, duration: Duration) -> Result<(), GattError> {
        self.stop();

        // Observers hear `Started` before any report the backend makes from `start`
        let generation = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.scanning = true;
            inner.devices.clear();
            inner.seen.clear();
            inner.notify(ScanEvent::Started);
            inner.generation
        };

        let sink = DiscoverySink {
            generation,
            inner: self.inner.clone(),
        };
        if let Err(e) = self.scanner.start(sink) {
            let mut inner = lock(&self.inner);
            if inner.generation == generation {
                inner.scanning = false;
                inner.notify(ScanEvent::Stopped(StopReason::StartFailed));
            }
            return Err(e);
        }

        info!("Start LE scan for {:?}", duration);

        let scanner = self.scanner.clone();
        let inner = self.inner.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            stop_generation(&scanner, &inner, generation, StopReason::Timeout);
        });

        lock(&self.inner).timer = Some(timer);
        Ok(())
    }

    /// Stop scanning. Stopping an idle session does nothing.
    pub fn stop(&self) {
        let (generation, timer) = {
            let mut inner = lock(&self.inner);
            (inner.generation, inner.timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        stop_generation(&self.scanner, &self.inner, generation, StopReason::Requested);
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.inner).scanning
    }

    /// Devices discovered so far in the current (or last) session, in discovery order.
    pub fn devices(&self) -> Vec<DeviceIdentity> {
        lock(&self.inner).devices.clone()
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn stop_generation(
    scanner: &Arc<dyn BleScanner>,
    inner: &Mutex<ScanInner>,
    generation: u64,
    reason: StopReason,
) {
    {
        let mut inner = lock(inner);
        if !inner.scanning || inner.generation != generation {
            return;
        }
        inner.scanning = false;
        if reason == StopReason::Timeout {
            inner.timer = None;
        }
        inner.notify(ScanEvent::Stopped(reason));
    }
    scanner.stop();
    info!("Stop LE scan ({:?})", reason);
}

/// Connect automatically to the first device advertising a given name.
///
/// The session only reports devices; the caller applies this policy to the
/// stream of [`ScanEvent::DeviceFound`] events.
#[derive(Debug, Clone)]
pub struct AutoConnectPolicy {
    pub enabled: bool,
    pub name_filter: String,
}

impl AutoConnectPolicy {
    pub fn new(enabled: bool, name_filter: impl Into<String>) -> Self {
        Self {
            enabled,
            name_filter: name_filter.into(),
        }
    }

    pub fn matches(&self, device: &DeviceIdentity) -> bool {
        self.enabled && device.name == self.name_filter
    }

    /// If `event` reports a matching device, stop `session` and return the device.
    pub fn apply(&self, session: &ScanSession, event: &ScanEvent) -> Option<DeviceIdentity> {
        match event {
            ScanEvent::DeviceFound(device) if self.matches(device) => {
                info!("Auto-connect match: {}", device.address);
                session.stop();
                Some(device.clone())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::MockScanner;

    fn device(address: &str, name: &str) -> DeviceIdentity {
        DeviceIdentity::new(address, name)
    }

    #[tokio::test]
    async fn test_duplicates_are_reported_once() {
        let scanner = Arc::new(MockScanner::new());
        let session = ScanSession::new(scanner.clone());
        let mut events = session.subscribe();

        session.start(Duration::from_secs(10)).unwrap();
        assert!(scanner.advertise(device("AA:BB:CC:DD:EE:FF", "DSSCSA_8")));
        assert!(!scanner.advertise(device("AA:BB:CC:DD:EE:FF", "DSSCSA_8")));
        assert!(scanner.advertise(device("11:22:33:44:55:66", "")));

        assert_eq!(session.devices().len(), 2);
        assert_eq!(events.recv().await, Some(ScanEvent::Started));
        assert!(matches!(events.recv().await, Some(ScanEvent::DeviceFound(d)) if d.name == "DSSCSA_8"));
        assert!(matches!(events.recv().await, Some(ScanEvent::DeviceFound(d)) if d.name.is_empty()));
    }

    #[tokio::test]
    async fn test_late_reports_after_stop_are_dropped() {
        let scanner = Arc::new(MockScanner::new());
        let session = ScanSession::new(scanner.clone());

        session.start(Duration::from_secs(10)).unwrap();
        let sink = scanner.sink().unwrap();
        session.stop();

        assert!(!sink.report(device("AA:BB:CC:DD:EE:FF", "late")));
        assert!(session.devices().is_empty());
        assert_eq!(scanner.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let scanner = Arc::new(MockScanner::new());
        let session = ScanSession::new(scanner.clone());
        let mut events = session.subscribe();

        session.stop();
        session.start(Duration::from_secs(10)).unwrap();
        session.stop();
        session.stop();

        assert_eq!(scanner.stop_count(), 1);
        assert_eq!(events.recv().await, Some(ScanEvent::Started));
        assert_eq!(events.recv().await, Some(ScanEvent::Stopped(StopReason::Requested)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_times_out() {
        let scanner = Arc::new(MockScanner::new());
        let session = ScanSession::new(scanner.clone());
        let mut events = session.subscribe();

        session.start(Duration::from_millis(10_000)).unwrap();
        assert_eq!(events.recv().await, Some(ScanEvent::Started));

        tokio::time::sleep(Duration::from_millis(9_999)).await;
        assert!(session.is_scanning());

        assert_eq!(events.recv().await, Some(ScanEvent::Stopped(StopReason::Timeout)));
        assert!(!session.is_scanning());
        assert_eq!(scanner.stop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_timer_does_not_stop_new_session() {
        let scanner = Arc::new(MockScanner::new());
        let session = ScanSession::new(scanner.clone());

        session.start(Duration::from_secs(5)).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        session.start(Duration::from_secs(5)).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(session.is_scanning());
    }

    #[tokio::test]
    async fn test_adapter_missing() {
        let scanner = Arc::new(MockScanner::without_adapter());
        let session = ScanSession::new(scanner);
        let mut events = session.subscribe();
        assert_eq!(
            session.start(Duration::from_secs(1)),
            Err(GattError::AdapterUnavailable)
        );
        assert!(!session.is_scanning());
        assert_eq!(events.recv().await, Some(ScanEvent::Started));
        assert_eq!(
            events.recv().await,
            Some(ScanEvent::Stopped(StopReason::StartFailed))
        );
    }

    #[tokio::test]
    async fn test_started_precedes_reports_made_during_start() {
        let scanner = Arc::new(MockScanner::new());
        scanner.advertise_on_start(device("AA:BB:CC:DD:EE:FF", "DSSCSA_8"));
        let session = ScanSession::new(scanner.clone());
        let mut events = session.subscribe();

        session.start(Duration::from_secs(10)).unwrap();
        assert_eq!(events.recv().await, Some(ScanEvent::Started));
        assert!(matches!(events.recv().await, Some(ScanEvent::DeviceFound(d)) if d.name == "DSSCSA_8"));
        assert_eq!(session.devices().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_connect_policy() {
        let scanner = Arc::new(MockScanner::new());
        let session = ScanSession::new(scanner.clone());
        let policy = AutoConnectPolicy::new(true, "DSSCSA_8");

        session.start(Duration::from_secs(10)).unwrap();
        let other = ScanEvent::DeviceFound(device("11:22:33:44:55:66", "other"));
        assert_eq!(policy.apply(&session, &other), None);
        assert!(session.is_scanning());

        let target = ScanEvent::DeviceFound(device("AA:BB:CC:DD:EE:FF", "DSSCSA_8"));
        assert!(policy.apply(&session, &target).is_some());
        assert!(!session.is_scanning());

        let disabled = AutoConnectPolicy::new(false, "DSSCSA_8");
        assert!(!disabled.matches(&device("AA:BB:CC:DD:EE:FF", "DSSCSA_8")));
    }
}
