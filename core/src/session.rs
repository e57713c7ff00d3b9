//! Per-peripheral session state.
//!
//! A session is created on the first discovery of a previously-unseen
//! identity and owned by the registry for its lifetime. All mutation
//! happens on the controller's serialized task; observers only ever see
//! immutable [`SessionSnapshot`] values.

use crate::profile::DeviceProfile;
use crate::timer::WatchdogTimer;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// Stable, transport-assigned identifier for a physical peripheral.
///
/// Equality is identity-based, never by display name: names may collide
/// or be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity(Uuid);

impl DeviceIdentity {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form: first group is enough to tell devices apart in logs.
        let s = self.0.to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Position of a session in the connection/transfer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Known from scanning, no link activity.
    Idle,
    /// Transport connect requested, confirmation pending.
    Connecting,
    /// Link up, service/characteristic discovery pending.
    Connected,
    /// Both channels resolved; commands accepted.
    Ready,
    /// Outbound buffer prepared, next fragment about to be written.
    Sending,
    /// One fragment written, acknowledgement pending.
    AwaitingSendAck,
    /// Command fully acknowledged, first response fragment pending.
    AwaitingResponse,
    /// Response fragments arriving.
    Receiving,
    /// Transport disconnect requested, confirmation pending.
    Disconnecting,
    /// Evicted; the session will not be reused.
    Terminated,
}

impl Phase {
    /// An outbound transfer is in flight.
    pub fn is_sending(self) -> bool {
        matches!(self, Phase::Sending | Phase::AwaitingSendAck)
    }

    /// A command answer is outstanding.
    pub fn is_waiting_answer(self) -> bool {
        matches!(self, Phase::AwaitingResponse | Phase::Receiving)
    }

    /// The link is established (discovery may still be pending).
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Phase::Connected
                | Phase::Ready
                | Phase::Sending
                | Phase::AwaitingSendAck
                | Phase::AwaitingResponse
                | Phase::Receiving
        )
    }
}

/// Immutable view of a session, delivered to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub identity: DeviceIdentity,
    pub name: Option<String>,
    pub phase: Phase,
    pub profile: Option<DeviceProfile>,
}

/// Mutable per-peripheral state: identity, link handles, transfer buffers
/// and the current phase. Owns its watchdog timer.
pub struct DeviceSession {
    identity: DeviceIdentity,
    name: Option<String>,
    phase: Phase,
    profile: Option<DeviceProfile>,
    write_channel: Option<Uuid>,
    read_channel: Option<Uuid>,
    outbound: Vec<u8>,
    acked: usize,
    in_flight: usize,
    inbound: Vec<u8>,
    timer: WatchdogTimer,
}

impl DeviceSession {
    pub fn new(identity: DeviceIdentity, name: Option<String>, timer: WatchdogTimer) -> Self {
        Self {
            identity,
            name,
            phase: Phase::Idle,
            profile: None,
            write_channel: None,
            read_channel: None,
            outbound: Vec::new(),
            acked: 0,
            in_flight: 0,
            inbound: Vec::new(),
            timer,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<String>) {
        if name.is_some() {
            self.name = name;
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(identity = %self.identity, from = ?self.phase, to = ?phase, "phase transition");
            self.phase = phase;
        }
    }

    pub fn profile(&self) -> Option<&DeviceProfile> {
        self.profile.as_ref()
    }

    pub fn set_profile(&mut self, profile: DeviceProfile) {
        self.profile = Some(profile);
    }

    pub fn write_channel(&self) -> Option<Uuid> {
        self.write_channel
    }

    pub fn read_channel(&self) -> Option<Uuid> {
        self.read_channel
    }

    pub fn set_write_channel(&mut self, characteristic: Uuid) {
        self.write_channel = Some(characteristic);
    }

    pub fn set_read_channel(&mut self, characteristic: Uuid) {
        self.read_channel = Some(characteristic);
    }

    /// Profile assigned and both channels resolved.
    pub fn is_link_ready(&self) -> bool {
        self.profile.is_some() && self.write_channel.is_some() && self.read_channel.is_some()
    }

    pub fn timer(&self) -> &WatchdogTimer {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut WatchdogTimer {
        &mut self.timer
    }

    /// Stage an outbound transfer: payload plus the profile's terminator.
    ///
    /// Callers must have verified a profile is assigned.
    pub fn stage_outbound(&mut self, payload: &[u8], terminator: &[u8]) {
        self.outbound.clear();
        self.outbound.extend_from_slice(payload);
        self.outbound.extend_from_slice(terminator);
        self.acked = 0;
        self.in_flight = 0;
    }

    /// Next unacknowledged fragment, at most `max` bytes. `None` once the
    /// whole buffer is acknowledged.
    pub fn next_fragment(&self, max: usize) -> Option<&[u8]> {
        if self.acked >= self.outbound.len() {
            return None;
        }
        let end = usize::min(self.acked + max, self.outbound.len());
        Some(&self.outbound[self.acked..end])
    }

    /// Record the size of the fragment just written.
    pub fn mark_in_flight(&mut self, len: usize) {
        self.in_flight = len;
    }

    /// Advance the acknowledged cursor past the in-flight fragment.
    /// Returns `true` while more of the buffer remains unacknowledged.
    pub fn acknowledge_fragment(&mut self) -> bool {
        self.acked += self.in_flight;
        self.in_flight = 0;
        self.acked < self.outbound.len()
    }

    /// True once the very first fragment of the staged message has not yet
    /// been acknowledged.
    pub fn is_first_fragment(&self) -> bool {
        self.acked == 0
    }

    pub fn clear_outbound(&mut self) {
        self.outbound.clear();
        self.acked = 0;
        self.in_flight = 0;
    }

    pub fn append_inbound(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Drain the accumulation buffer for delivery or for error cleanup.
    pub fn take_inbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.inbound)
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Does the accumulated response close with the profile's terminator?
    pub fn inbound_terminated(&self) -> bool {
        match &self.profile {
            Some(profile) => self.inbound.ends_with(&profile.terminator),
            None => false,
        }
    }

    /// Reset transfer buffers only, keeping link handles and profile.
    pub fn reset_transfer(&mut self) {
        self.clear_outbound();
        self.inbound.clear();
    }

    /// Full reset: cancel the watchdog, drop link handles, profile and
    /// buffers. Used on connect failure and terminal disconnect.
    pub fn reset(&mut self) {
        self.timer.cancel();
        self.reset_transfer();
        self.profile = None;
        self.write_channel = None;
        self.read_channel = None;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            identity: self.identity,
            name: self.name.clone(),
            phase: self.phase,
            profile: self.profile.clone(),
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identity", &self.identity)
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("outbound", &self.outbound.len())
            .field("acked", &self.acked)
            .field("inbound", &self.inbound.len())
            .finish()
    }
}
