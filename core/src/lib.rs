//! perch-core — session management for serial-over-GATT peripherals.
//!
//! The crate drives battery-powered wireless peripherals that speak a
//! line-oriented command protocol over a UART-style GATT service: scan,
//! connect, profile negotiation, chunked command writes and
//! terminator-delimited response reads, all guarded by single-shot
//! watchdog timers.
//!
//! The entry point is [`SessionManager::spawn`]: hand it a
//! [`TransportAdapter`], a [`ProfileTable`] and the sinks, then drive it
//! through the handle and observe outcomes through the sinks.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod profile;
pub mod registry;
pub mod session;
pub mod timer;
pub mod transport;

pub use config::LinkTimeouts;
pub use controller::SessionManager;
pub use error::LinkError;
pub use events::{DeviceSink, GlobalSink, NullSink};
pub use profile::{DeviceProfile, ProfileTable, DEFAULT_FRAGMENT_SIZE};
pub use registry::Partition;
pub use session::{DeviceIdentity, Phase, SessionSnapshot};
pub use transport::{TransportAdapter, TransportError, TransportEvent};
