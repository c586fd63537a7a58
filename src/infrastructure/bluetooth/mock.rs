//! Scriptable BLE capabilities
//!
//! Stand-ins for the platform stack. Tests drive them by hand; with
//! [`MockTransport::responsive`] the transport answers every request the way
//! a well-behaved peripheral would.

use crate::domain::models::{BdAddr, DeviceIdentity};
use crate::error::GattError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::scanner::DiscoverySink;
use crate::infrastructure::bluetooth::transport::{
    BleScanner, GattTransport, TransportEvent, TransportSink,
};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// A request recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Open(BdAddr),
    DiscoverServices,
    Read,
    Write(Vec<u8>),
    SetNotifications(bool),
    Close,
}

struct TransportState {
    adapter: bool,
    responsive: bool,
    fail_io: bool,
    fail_open: bool,
    characteristics: HashSet<(Uuid, Uuid)>,
    value: Vec<u8>,
    sink: Option<TransportSink>,
    calls: Vec<TransportCall>,
}

pub struct MockTransport {
    state: Mutex<TransportState>,
}

impl MockTransport {
    /// Adapter present, switch characteristic present, nothing answered automatically.
    pub fn new() -> Self {
        let mut characteristics = HashSet::new();
        characteristics.insert((protocol::SERVICE_UUID, protocol::CHARACTERISTIC_UUID));
        Self {
            state: Mutex::new(TransportState {
                adapter: true,
                responsive: false,
                fail_io: false,
                fail_open: false,
                characteristics,
                value: Vec::new(),
                sink: None,
                calls: Vec::new(),
            }),
        }
    }

    pub fn without_adapter() -> Self {
        let transport = Self::new();
        transport.lock().adapter = false;
        transport
    }

    pub fn without_characteristic() -> Self {
        let transport = Self::new();
        transport.lock().characteristics.clear();
        transport
    }

    /// Link up, discovery and notification requests succeed immediately;
    /// reads return the last written value.
    pub fn responsive() -> Self {
        let transport = Self::new();
        transport.lock().responsive = true;
        transport
    }

    /// Make read/write/notification requests fail as if the link dropped.
    pub fn set_fail_io(&self, fail: bool) {
        self.lock().fail_io = fail;
    }

    /// Make `open` refuse synchronously, before any sink is handed out.
    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Deliver an event through the sink of the most recent `open`.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let sink = self.lock().sink.clone();
        sink.map(|s| s.send(event)).unwrap_or(false)
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn open_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, TransportCall::Open(_)))
            .count()
    }

    /// Payloads written to the characteristic, oldest first.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::Write(value) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn io(&self, call: TransportCall, reply: Option<TransportEvent>) -> Result<(), GattError> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.fail_io {
            return Err(GattError::TransportDisconnected("mock link lost".to_string()));
        }
        if state.responsive {
            if let (Some(sink), Some(event)) = (&state.sink, reply) {
                sink.send(event);
            }
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GattTransport for MockTransport {
    fn adapter_available(&self) -> bool {
        self.lock().adapter
    }

    fn open(&self, address: &BdAddr, sink: TransportSink) -> Result<(), GattError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Open(address.clone()));
        if state.fail_open {
            return Err(GattError::TransportDisconnected("mock open refused".to_string()));
        }
        if state.responsive {
            sink.send(TransportEvent::LinkUp);
        }
        state.sink = Some(sink);
        Ok(())
    }

    fn discover_services(&self) -> Result<(), GattError> {
        self.io(
            TransportCall::DiscoverServices,
            Some(TransportEvent::ServicesDiscovered { success: true }),
        )
    }

    fn resolve_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.lock().characteristics.contains(&(service, characteristic))
    }

    fn read(&self, _service: Uuid, _characteristic: Uuid) -> Result<(), GattError> {
        let value = self.lock().value.clone();
        self.io(TransportCall::Read, Some(TransportEvent::CharacteristicRead(value)))
    }

    fn write(&self, _service: Uuid, _characteristic: Uuid, value: &[u8]) -> Result<(), GattError> {
        self.io(TransportCall::Write(value.to_vec()), None)?;
        self.lock().value = value.to_vec();
        Ok(())
    }

    fn set_notifications(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), GattError> {
        self.io(
            TransportCall::SetNotifications(enabled),
            Some(TransportEvent::NotificationsChanged {
                enabled,
                success: true,
            }),
        )
    }

    fn close(&self) {
        self.lock().calls.push(TransportCall::Close);
    }
}

struct ScannerState {
    adapter: bool,
    sink: Option<DiscoverySink>,
    on_start: Vec<DeviceIdentity>,
    start_count: usize,
    stop_count: usize,
}

/// Scanner whose advertisements are injected by the test.
pub struct MockScanner {
    state: Mutex<ScannerState>,
}

impl MockScanner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScannerState {
                adapter: true,
                sink: None,
                on_start: Vec::new(),
                start_count: 0,
                stop_count: 0,
            }),
        }
    }

    pub fn without_adapter() -> Self {
        let scanner = Self::new();
        scanner.lock().adapter = false;
        scanner
    }

    /// Report an advertisement as the platform callback would.
    pub fn advertise(&self, device: DeviceIdentity) -> bool {
        let sink = self.lock().sink.clone();
        sink.map(|s| s.report(device)).unwrap_or(false)
    }

    /// Report `device` from inside the next `start` call, before it returns.
    pub fn advertise_on_start(&self, device: DeviceIdentity) {
        self.lock().on_start.push(device);
    }

    pub fn sink(&self) -> Option<DiscoverySink> {
        self.lock().sink.clone()
    }

    pub fn start_count(&self) -> usize {
        self.lock().start_count
    }

    pub fn stop_count(&self) -> usize {
        self.lock().stop_count
    }

    fn lock(&self) -> MutexGuard<'_, ScannerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MockScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl BleScanner for MockScanner {
    fn start(&self, sink: DiscoverySink) -> Result<(), GattError> {
        let mut state = self.lock();
        if !state.adapter {
            return Err(GattError::AdapterUnavailable);
        }
        state.start_count += 1;
        state.sink = Some(sink.clone());
        let queued = std::mem::take(&mut state.on_start);
        drop(state);
        for device in queued {
            sink.report(device);
        }
        Ok(())
    }

    fn stop(&self) {
        self.lock().stop_count += 1;
    }
}
