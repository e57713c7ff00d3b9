//! Transport adapter boundary.
//!
//! The radio stack (scanning, GATT discovery, packet I/O) lives behind
//! [`TransportAdapter`]. Commands flow down through the trait; everything
//! the hardware reports flows back up as [`TransportEvent`] values on the
//! controller's event channel, so all session mutation stays on one task.

use crate::session::DeviceIdentity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by transport commands.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Adapter unavailable")]
    AdapterUnavailable,
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Command failed: {0}")]
    CommandFailed(String),
}

/// Events emitted by the radio stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportEvent {
    /// A peripheral advertisement was seen.
    Discovered {
        identity: DeviceIdentity,
        name: Option<String>,
    },
    /// A requested connection came up.
    Connected { identity: DeviceIdentity },
    /// A requested connection failed before coming up.
    ConnectFailed {
        identity: DeviceIdentity,
        reason: String,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        identity: DeviceIdentity,
        services: Vec<Uuid>,
    },
    /// Characteristic discovery finished for one service.
    CharacteristicsDiscovered {
        identity: DeviceIdentity,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    /// The peripheral acknowledged the last fragment write.
    WriteAck { identity: DeviceIdentity },
    /// The last fragment write was rejected.
    WriteError {
        identity: DeviceIdentity,
        reason: String,
    },
    /// Notification bytes arrived on the read channel.
    DataReceived {
        identity: DeviceIdentity,
        bytes: Vec<u8>,
    },
    /// The link went down, requested or not.
    Disconnected {
        identity: DeviceIdentity,
        reason: Option<String>,
    },
    /// The adapter became available or was lost.
    AvailabilityChanged { available: bool },
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Discovered { identity, name } => {
                write!(f, "Discovered {{ {identity}, name: {name:?} }}")
            }
            TransportEvent::Connected { identity } => write!(f, "Connected {{ {identity} }}"),
            TransportEvent::ConnectFailed { identity, reason } => {
                write!(f, "ConnectFailed {{ {identity}, reason: {reason} }}")
            }
            TransportEvent::ServicesDiscovered { identity, services } => {
                write!(f, "ServicesDiscovered {{ {identity}, count: {} }}", services.len())
            }
            TransportEvent::CharacteristicsDiscovered {
                identity,
                characteristics,
                ..
            } => write!(
                f,
                "CharacteristicsDiscovered {{ {identity}, count: {} }}",
                characteristics.len()
            ),
            TransportEvent::WriteAck { identity } => write!(f, "WriteAck {{ {identity} }}"),
            TransportEvent::WriteError { identity, reason } => {
                write!(f, "WriteError {{ {identity}, reason: {reason} }}")
            }
            TransportEvent::DataReceived { identity, bytes } => {
                write!(f, "DataReceived {{ {identity}, len: {} }}", bytes.len())
            }
            TransportEvent::Disconnected { identity, reason } => {
                write!(f, "Disconnected {{ {identity}, reason: {reason:?} }}")
            }
            TransportEvent::AvailabilityChanged { available } => {
                write!(f, "AvailabilityChanged {{ {available} }}")
            }
        }
    }
}

/// The consumed radio-stack interface.
///
/// Every method is a request; completion is observed through
/// [`TransportEvent`]s, never through return values. A returned error
/// means the request could not even be issued.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    async fn scan_start(&self) -> Result<(), TransportError>;

    async fn scan_stop(&self) -> Result<(), TransportError>;

    async fn connect(&self, identity: DeviceIdentity) -> Result<(), TransportError>;

    /// Abort an in-flight connection attempt.
    async fn cancel_connect(&self, identity: DeviceIdentity) -> Result<(), TransportError>;

    async fn discover_services(&self, identity: DeviceIdentity) -> Result<(), TransportError>;

    async fn discover_characteristics(
        &self,
        identity: DeviceIdentity,
        service: Uuid,
    ) -> Result<(), TransportError>;

    /// Write one size-bounded fragment to a characteristic.
    async fn write_fragment(
        &self,
        identity: DeviceIdentity,
        characteristic: Uuid,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError>;

    async fn subscribe_notifications(
        &self,
        identity: DeviceIdentity,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, identity: DeviceIdentity) -> Result<(), TransportError>;
}
