//! Bluetooth Module
//!
//! BLE communication with a Jura coffee machine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ConnectionManager                      │
//! │  (keepalive, heartbeat, one-slot command channel)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌────────────┐
//! │  GattLink │  │  Polling   │  │  Protocol  │
//! │           │  │            │  │            │
//! │ - btleplug│  │ - ready    │  │ - UUIDs    │
//! │ - fake    │  │   polling  │  │ - frames   │
//! │           │  │ - retries  │  │ - cipher   │
//! └───────────┘  └────────────┘  └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Characteristics, frames and advertisement layout
//! - [`encryption`] - Nibble cipher applied to every frame
//! - [`link`] - GATT link seam and its btleplug implementation
//! - [`fake`] - Scripted link for tests
//! - [`command_channel`] - Latest-value-wins slot for the start command
//! - [`connection`] - Link lifecycle and heartbeat
//! - [`polling`] - Request/poll/read cycles
//! - [`scanner`] - BLE discovery

pub mod command_channel;
pub mod connection;
pub mod encryption;
pub mod fake;
pub mod link;
pub mod polling;
pub mod protocol;
pub mod scanner;

pub use connection::{ConnectionManager, LinkTiming};
pub use link::{BtleplugLink, GattLink};
