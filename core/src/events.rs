//! Observer interfaces for scan and session outcomes.
//!
//! Two roles, selected at construction time: [`GlobalSink`] for scan and
//! adapter-scoped events, [`DeviceSink`] for per-device session events.
//! One object may implement both. Methods default to no-ops so sinks only
//! override what they care about. Delivery happens from the controller
//! task, so events and errors for one device arrive in the order their
//! underlying events occurred.

use crate::error::LinkError;
use crate::session::SessionSnapshot;

/// Scan- and adapter-scoped events.
pub trait GlobalSink: Send + Sync {
    fn scan_began(&self) {}

    fn scan_ended(&self) {}

    fn scan_error(&self, _error: &LinkError) {}

    /// A previously-unseen peripheral was discovered.
    fn device_found(&self, _device: &SessionSnapshot) {}

    /// The adapter was lost while sessions were live. Emitted once per loss.
    fn adapter_error(&self, _error: &LinkError) {}
}

/// Per-device session events.
pub trait DeviceSink: Send + Sync {
    fn device_connected(&self, _device: &SessionSnapshot) {}

    fn device_connect_error(&self, _device: &SessionSnapshot, _error: &LinkError) {}

    /// Discovery resolved both channels; the device accepts commands.
    fn device_ready(&self, _device: &SessionSnapshot) {}

    /// A completed response, or a passive fragment when no answer was
    /// expected. Terminators are delivered intact, never trimmed.
    fn received_data(&self, _device: &SessionSnapshot, _bytes: &[u8]) {}

    fn device_write_error(&self, _device: &SessionSnapshot, _error: &LinkError) {}

    fn device_read_error(&self, _device: &SessionSnapshot, _error: &LinkError) {}

    fn device_error(&self, _device: &SessionSnapshot, _error: &LinkError) {}

    fn device_disconnected(&self, _device: &SessionSnapshot) {}
}

/// Sink that drops everything. Useful for managers that only poll state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl GlobalSink for NullSink {}
impl DeviceSink for NullSink {}
