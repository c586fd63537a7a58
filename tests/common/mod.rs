//! Shared helpers for the integration tests.

#![allow(dead_code)]

use hm10_switch_controller::domain::models::AppEvent;
use hm10_switch_controller::domain::settings::Settings;
use hm10_switch_controller::infrastructure::bluetooth::mock::{MockScanner, MockTransport};
use hm10_switch_controller::infrastructure::rfcomm::TcpRfcomm;
use hm10_switch_controller::{AuthorizationStore, BluetoothService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const PERIPHERAL: &str = "AA:BB:CC:DD:EE:FF";

pub struct Controller {
    pub service: BluetoothService,
    pub transport: Arc<MockTransport>,
    pub scanner: Arc<MockScanner>,
    pub events: mpsc::UnboundedReceiver<AppEvent>,
}

/// A controller over mock BLE capabilities and a loopback key channel.
pub fn controller(settings: &Settings, store: AuthorizationStore) -> Controller {
    let transport = Arc::new(MockTransport::responsive());
    let scanner = Arc::new(MockScanner::new());
    let (tx, events) = mpsc::unbounded_channel();
    let service = BluetoothService::new(
        transport.clone(),
        scanner.clone(),
        Arc::new(TcpRfcomm::new("127.0.0.1:0")),
        store,
        settings,
        tx,
    );
    Controller {
        service,
        transport,
        scanner,
        events,
    }
}

/// Receive events until one matches `pred`.
pub async fn wait_for(
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
