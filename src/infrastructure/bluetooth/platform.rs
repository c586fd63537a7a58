//! btleplug backend
//!
//! Implements the transport capabilities on top of the host Bluetooth stack
//! (BlueZ, CoreBluetooth or WinRT). Every request is started on the tokio
//! runtime the backend was created on and reports back through the sink.

use crate::domain::models::{BdAddr, DeviceIdentity};
use crate::error::GattError;
use crate::infrastructure::bluetooth::scanner::DiscoverySink;
use crate::infrastructure::bluetooth::transport::{
    BleScanner, GattTransport, TransportEvent, TransportSink,
};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// First adapter of the host, if any.
pub async fn default_adapter() -> Result<Option<Adapter>, btleplug::Error> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    Ok(adapters.into_iter().next())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct PlatformLink {
    peripheral: Option<Peripheral>,
    sink: Option<TransportSink>,
    tasks: Vec<JoinHandle<()>>,
}

impl PlatformLink {
    fn release(&mut self) -> Option<Peripheral> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.sink = None;
        self.peripheral.take()
    }
}

pub struct BtleplugTransport {
    adapter: Option<Adapter>,
    runtime: Handle,
    link: Arc<Mutex<PlatformLink>>,
}

impl BtleplugTransport {
    /// Must be called from within a tokio runtime.
    pub fn new(adapter: Option<Adapter>) -> Self {
        Self {
            adapter,
            runtime: Handle::current(),
            link: Arc::new(Mutex::new(PlatformLink::default())),
        }
    }

    fn connected(&self) -> Result<(Peripheral, TransportSink), GattError> {
        let link = lock(&self.link);
        match (&link.peripheral, &link.sink) {
            (Some(peripheral), Some(sink)) => Ok((peripheral.clone(), sink.clone())),
            _ => Err(GattError::TransportDisconnected("no peripheral".to_string())),
        }
    }

    fn characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic, GattError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or(GattError::CharacteristicNotFound {
                service,
                characteristic,
            })
    }
}

impl GattTransport for BtleplugTransport {
    fn adapter_available(&self) -> bool {
        self.adapter.is_some()
    }

    fn open(&self, address: &BdAddr, sink: TransportSink) -> Result<(), GattError> {
        let adapter = self.adapter.clone().ok_or(GattError::AdapterUnavailable)?;
        let address = address.clone();
        let link = self.link.clone();

        let mut state = lock(&self.link);
        state.release();
        state.sink = Some(sink.clone());

        let task = self.runtime.spawn(async move {
            let peripheral = match find_peripheral(&adapter, &address).await {
                Ok(Some(peripheral)) => peripheral,
                Ok(None) => {
                    sink.send(TransportEvent::LinkFailed(format!("{} not found", address)));
                    return;
                }
                Err(e) => {
                    sink.send(TransportEvent::LinkFailed(e.to_string()));
                    return;
                }
            };

            if let Err(e) = peripheral.connect().await {
                sink.send(TransportEvent::LinkFailed(e.to_string()));
                return;
            }

            let mut adapter_events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    sink.send(TransportEvent::LinkFailed(e.to_string()));
                    return;
                }
            };
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    sink.send(TransportEvent::LinkFailed(e.to_string()));
                    return;
                }
            };

            lock(&link).peripheral = Some(peripheral.clone());
            sink.send(TransportEvent::LinkUp);

            let id = peripheral.id();
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) => {
                            sink.send(TransportEvent::CharacteristicChanged(n.value));
                        }
                        None => break,
                    },
                    event = adapter_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => break,
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            debug!("Peripheral {} went away", address);
            sink.send(TransportEvent::LinkDown);
        });
        state.tasks.push(task);
        Ok(())
    }

    fn discover_services(&self) -> Result<(), GattError> {
        let (peripheral, sink) = self.connected()?;
        self.runtime.spawn(async move {
            let success = match peripheral.discover_services().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    false
                }
            };
            sink.send(TransportEvent::ServicesDiscovered { success });
        });
        Ok(())
    }

    fn resolve_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.connected()
            .map(|(p, _)| Self::characteristic(&p, service, characteristic).is_ok())
            .unwrap_or(false)
    }

    fn read(&self, service: Uuid, characteristic: Uuid) -> Result<(), GattError> {
        let (peripheral, sink) = self.connected()?;
        let characteristic = Self::characteristic(&peripheral, service, characteristic)?;
        self.runtime.spawn(async move {
            match peripheral.read(&characteristic).await {
                Ok(value) => sink.send(TransportEvent::CharacteristicRead(value)),
                Err(e) => {
                    warn!("Read failed: {}", e);
                    sink.send(TransportEvent::LinkDown)
                }
            };
        });
        Ok(())
    }

    fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<(), GattError> {
        let (peripheral, sink) = self.connected()?;
        let characteristic = Self::characteristic(&peripheral, service, characteristic)?;
        let value = value.to_vec();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral
                .write(&characteristic, &value, WriteType::WithoutResponse)
                .await
            {
                warn!("Write failed: {}", e);
                sink.send(TransportEvent::LinkDown);
            }
        });
        Ok(())
    }

    fn set_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), GattError> {
        let (peripheral, sink) = self.connected()?;
        let characteristic = Self::characteristic(&peripheral, service, characteristic)?;
        self.runtime.spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };
            if let Err(e) = &result {
                warn!("Changing notifications failed: {}", e);
            }
            sink.send(TransportEvent::NotificationsChanged {
                enabled,
                success: result.is_ok(),
            });
        });
        Ok(())
    }

    fn close(&self) {
        let peripheral = lock(&self.link).release();
        if let Some(peripheral) = peripheral {
            self.runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect failed: {}", e);
                }
            });
        }
    }
}

async fn find_peripheral(
    adapter: &Adapter,
    address: &BdAddr,
) -> Result<Option<Peripheral>, btleplug::Error> {
    for peripheral in adapter.peripherals().await? {
        if peripheral.address().to_string().eq_ignore_ascii_case(address.as_str()) {
            return Ok(Some(peripheral));
        }
    }
    Ok(None)
}

pub struct BtleplugScanner {
    adapter: Option<Adapter>,
    runtime: Handle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugScanner {
    /// Must be called from within a tokio runtime.
    pub fn new(adapter: Option<Adapter>) -> Self {
        Self {
            adapter,
            runtime: Handle::current(),
            task: Mutex::new(None),
        }
    }
}

impl BleScanner for BtleplugScanner {
    fn start(&self, sink: DiscoverySink) -> Result<(), GattError> {
        let adapter = self.adapter.clone().ok_or(GattError::AdapterUnavailable)?;

        let task = self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot listen for advertisements: {}", e);
                    return;
                }
            };
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                warn!("Failed to start LE scan: {}", e);
                return;
            }
            info!("LE scan running");

            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let name = match peripheral.properties().await {
                    Ok(Some(props)) => props.local_name.unwrap_or_default(),
                    _ => String::new(),
                };
                // Repeated advertisements are filtered by the session
                sink.report(DeviceIdentity::new(peripheral.address().to_string(), name));
            }
        });

        if let Some(previous) = lock(&self.task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        if let Some(adapter) = self.adapter.clone() {
            self.runtime.spawn(async move {
                if let Err(e) = adapter.stop_scan().await {
                    debug!("Failed to stop LE scan: {}", e);
                }
            });
        }
    }
}
