//! Bluetooth Module
//!
//! Provides BLE communication with the HM-10 switch peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    BluetoothService                      │
//! │  (Main coordinator - public API for the application)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌────────────┐  ┌────────────┐  ┌────────────┐
//! │  Scanner   │  │ Connection │  │  Protocol  │
//! │            │  │            │  │            │
//! │ - timed    │  │ - GATT     │  │ - UUIDs    │
//! │   discovery│  │   state    │  │ - text     │
//! │ - dedup    │  │   machine  │  │   codec    │
//! └─────┬──────┘  └─────┬──────┘  └────────────┘
//!       │               │
//!       ▼               ▼
//! ┌─────────────────────────────┐
//! │ Transport (platform traits) │
//! │  mock / btleplug backends   │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Identifiers and the On/Off/Auth/Ready/? vocabulary
//! - [`transport`] - Capabilities a platform BLE stack provides
//! - [`scanner`] - Timed, de-duplicated device discovery
//! - [`connection`] - Connection state machine of one peripheral
//! - [`service`] - Main service coordinator
//! - [`mock`] - Scriptable capabilities for tests and demos
//! - `platform` - btleplug backend (`btleplug` feature)

pub mod connection;
pub mod mock;
#[cfg(feature = "btleplug")]
pub mod platform;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod transport;

// Re-export main service for convenience
pub use service::BluetoothService;
