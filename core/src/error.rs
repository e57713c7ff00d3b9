//! Error taxonomy for scan and session failures.
//!
//! Every rejected precondition and every watchdog-driven failure maps to
//! exactly one variant. Errors are reported to the sinks, never returned
//! synchronously from the state-changing entry points.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors delivered to the global or per-device sinks.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkError {
    #[error("A scan is in progress; device operations are rejected until it ends")]
    UnableToPerformDuringScan,
    #[error("A connection to this device is already being established")]
    AlreadyConnecting,
    #[error("Device is already connected")]
    AlreadyConnected,
    #[error("Device did not complete the connection in time")]
    ConnectTimedOut,
    #[error("Device is not connected")]
    NotConnected,
    #[error("Device link is not ready for data transfer")]
    DeviceNotReady,
    #[error("Device is already disconnecting")]
    AlreadyDisconnecting,
    #[error("Device did not confirm disconnection in time")]
    DisconnectTimedOut,
    #[error("A previous send is still in progress")]
    SendingDataAlready,
    #[error("Still waiting for the answer to a previous command")]
    WaitingCommandAnswer,
    #[error("Fragment write was not acknowledged in time")]
    SendingDataTimeout,
    #[error("Response did not terminate in time")]
    ReceivingDataTimeout,
    #[error("No device profile matches the discovered services")]
    UnsupportedDevice,
    #[error("Bluetooth adapter is not ready or was lost")]
    BluetoothNotReadyOrLost,
    #[error("Unknown timeout parameter: {0}")]
    UnknownTimeout(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

impl LinkError {
    /// Stable machine-readable code for each variant.
    pub fn code(&self) -> &'static str {
        match self {
            LinkError::UnableToPerformDuringScan => "UNABLE_TO_PERFORM_DURING_SCAN",
            LinkError::AlreadyConnecting => "ALREADY_CONNECTING",
            LinkError::AlreadyConnected => "ALREADY_CONNECTED",
            LinkError::ConnectTimedOut => "CONNECT_TIMED_OUT",
            LinkError::NotConnected => "NOT_CONNECTED",
            LinkError::DeviceNotReady => "DEVICE_NOT_READY",
            LinkError::AlreadyDisconnecting => "ALREADY_DISCONNECTING",
            LinkError::DisconnectTimedOut => "DISCONNECT_TIMED_OUT",
            LinkError::SendingDataAlready => "SENDING_DATA_ALREADY",
            LinkError::WaitingCommandAnswer => "WAITING_COMMAND_ANSWER",
            LinkError::SendingDataTimeout => "SENDING_DATA_TIMEOUT",
            LinkError::ReceivingDataTimeout => "RECEIVING_DATA_TIMEOUT",
            LinkError::UnsupportedDevice => "UNSUPPORTED_DEVICE",
            LinkError::BluetoothNotReadyOrLost => "BLUETOOTH_NOT_READY_OR_LOST",
            LinkError::UnknownTimeout(_) => "UNKNOWN_TIMEOUT",
            LinkError::Transport(_) => "TRANSPORT_ERROR",
        }
    }

    /// True for watchdog-driven failures (retryable by re-issuing the call).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectTimedOut
                | LinkError::DisconnectTimedOut
                | LinkError::SendingDataTimeout
                | LinkError::ReceivingDataTimeout
        )
    }
}
