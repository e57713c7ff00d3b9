//! Single-shot watchdog timers.
//!
//! A watchdog is the sole timeout-detection mechanism in the system: every
//! bounded wait arms one, tagged with the protocol phase it guards. Expiry
//! is not a callback into the session. It is a message posted onto the
//! controller's serialized event channel, where the controller interprets
//! it against current state. Stale expiries (raced against a cancel or a
//! re-schedule) are filtered by token.

use crate::session::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Protocol phase a deadline is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchdogPhase {
    /// Waiting for the transport to confirm a connection.
    Connect,
    /// Waiting for the acknowledgement of one outbound fragment.
    SendAck,
    /// Waiting for the first or the next inbound response fragment.
    Response,
    /// Waiting for the transport to confirm a disconnection.
    Disconnect,
}

/// Expiry message posted onto the controller's event channel.
#[derive(Debug, Clone)]
pub struct WatchdogExpiry {
    pub identity: DeviceIdentity,
    pub phase: WatchdogPhase,
    pub token: u64,
}

struct Armed {
    phase: WatchdogPhase,
    token: u64,
    handle: JoinHandle<()>,
}

/// At-most-one-active deadline owned by a device session.
///
/// `schedule` implicitly cancels any prior deadline, so a timer can never
/// double-fire. `cancel` is idempotent.
pub struct WatchdogTimer {
    identity: DeviceIdentity,
    expiry_tx: mpsc::UnboundedSender<WatchdogExpiry>,
    seq: u64,
    armed: Option<Armed>,
}

impl WatchdogTimer {
    pub fn new(
        identity: DeviceIdentity,
        expiry_tx: mpsc::UnboundedSender<WatchdogExpiry>,
    ) -> Self {
        Self {
            identity,
            expiry_tx,
            seq: 0,
            armed: None,
        }
    }

    /// Arm a single-shot deadline for `phase`, replacing any prior one.
    pub fn schedule(&mut self, phase: WatchdogPhase, after: Duration) {
        self.cancel();
        self.seq += 1;
        let token = self.seq;
        let identity = self.identity;
        let tx = self.expiry_tx.clone();
        trace!(%identity, ?phase, ?after, token, "watchdog armed");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Receiver gone means the controller shut down; nothing to do.
            let _ = tx.send(WatchdogExpiry {
                identity,
                phase,
                token,
            });
        });
        self.armed = Some(Armed {
            phase,
            token,
            handle,
        });
    }

    /// Disarm the deadline. No-op if unset or already fired.
    pub fn cancel(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.handle.abort();
            trace!(identity = %self.identity, phase = ?armed.phase, "watchdog canceled");
        }
    }

    /// True while a deadline is pending.
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Phase of the pending deadline, if any.
    pub fn armed_phase(&self) -> Option<WatchdogPhase> {
        self.armed.as_ref().map(|a| a.phase)
    }

    /// Consume an expiry if it matches the pending deadline.
    ///
    /// Returns `true` exactly once per scheduled deadline; stale expiries
    /// from canceled or replaced schedules return `false`.
    pub fn acknowledge(&mut self, expiry: &WatchdogExpiry) -> bool {
        match &self.armed {
            Some(armed) if armed.token == expiry.token && armed.phase == expiry.phase => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for WatchdogTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
