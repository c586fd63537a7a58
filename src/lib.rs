//! Controller side of an HM-10 based smart switch.
//!
//! - [`domain`]: models, authorization policy, settings
//! - [`infrastructure`]: BLE link and scan, RFCOMM key handoff, logging
//! - [`error`]: error types of each seam

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::authorization::AuthorizationStore;
pub use domain::models::{AppEvent, BdAddr, LinkEvent, LinkState, ProtocolMessage};
pub use error::{GattError, HandshakeError, StoreError};
pub use infrastructure::bluetooth::BluetoothService;
