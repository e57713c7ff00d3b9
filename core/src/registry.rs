//! Device registry — authoritative session collections per lifecycle phase.
//!
//! Four partitions: scanned (historical record, independent) and the three
//! active ones (connecting, connected, disconnecting), which are mutually
//! exclusive per identity. All mutation is synchronous on the controller
//! task, so two partitions are never read torn mid-transition.

use crate::session::{DeviceIdentity, DeviceSession};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Named lifecycle partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    Scanned,
    Connecting,
    Connected,
    Disconnecting,
}

impl Partition {
    /// The partitions whose membership is mutually exclusive.
    pub fn active() -> [Partition; 3] {
        [
            Partition::Connecting,
            Partition::Connected,
            Partition::Disconnecting,
        ]
    }

    fn is_active(self) -> bool {
        !matches!(self, Partition::Scanned)
    }
}

/// Session store plus insertion-ordered membership lists.
#[derive(Default)]
pub struct DeviceRegistry {
    sessions: HashMap<DeviceIdentity, DeviceSession>,
    scanned: Vec<DeviceIdentity>,
    connecting: Vec<DeviceIdentity>,
    connected: Vec<DeviceIdentity>,
    disconnecting: Vec<DeviceIdentity>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, partition: Partition) -> &Vec<DeviceIdentity> {
        match partition {
            Partition::Scanned => &self.scanned,
            Partition::Connecting => &self.connecting,
            Partition::Connected => &self.connected,
            Partition::Disconnecting => &self.disconnecting,
        }
    }

    fn list_mut(&mut self, partition: Partition) -> &mut Vec<DeviceIdentity> {
        match partition {
            Partition::Scanned => &mut self.scanned,
            Partition::Connecting => &mut self.connecting,
            Partition::Connected => &mut self.connected,
            Partition::Disconnecting => &mut self.disconnecting,
        }
    }

    /// Store a session. The session starts with no partition membership.
    pub fn insert_session(&mut self, session: DeviceSession) {
        self.sessions.insert(session.identity(), session);
    }

    pub fn session(&self, identity: &DeviceIdentity) -> Option<&DeviceSession> {
        self.sessions.get(identity)
    }

    pub fn session_mut(&mut self, identity: &DeviceIdentity) -> Option<&mut DeviceSession> {
        self.sessions.get_mut(identity)
    }

    pub fn has_session(&self, identity: &DeviceIdentity) -> bool {
        self.sessions.contains_key(identity)
    }

    /// Add an identity to a partition. Adding to an active partition first
    /// removes the identity from the other active ones, so exclusivity
    /// holds structurally. No-op if already present.
    pub fn add(&mut self, partition: Partition, identity: DeviceIdentity) {
        if partition.is_active() {
            for other in Partition::active() {
                if other != partition {
                    self.remove(other, &identity);
                }
            }
        }
        let list = self.list_mut(partition);
        if !list.contains(&identity) {
            list.push(identity);
        }
    }

    /// Remove an identity from a partition. No-op if absent.
    pub fn remove(&mut self, partition: Partition, identity: &DeviceIdentity) {
        self.list_mut(partition).retain(|id| id != identity);
    }

    pub fn contains(&self, partition: Partition, identity: &DeviceIdentity) -> bool {
        self.list(partition).contains(identity)
    }

    /// Session lookup scoped to one partition.
    pub fn find(&self, partition: Partition, identity: &DeviceIdentity) -> Option<&DeviceSession> {
        if self.contains(partition, identity) {
            self.sessions.get(identity)
        } else {
            None
        }
    }

    /// Which active partition holds this identity, if any.
    pub fn active_partition_of(&self, identity: &DeviceIdentity) -> Option<Partition> {
        Partition::active()
            .into_iter()
            .find(|p| self.contains(*p, identity))
    }

    /// Session lookup across the union of the active partitions, for
    /// transport-event dispatch where the caller doesn't know the phase.
    pub fn find_active(&self, identity: &DeviceIdentity) -> Option<&DeviceSession> {
        self.active_partition_of(identity)
            .and_then(|_| self.sessions.get(identity))
    }

    pub fn find_active_mut(&mut self, identity: &DeviceIdentity) -> Option<&mut DeviceSession> {
        if self.active_partition_of(identity).is_some() {
            self.sessions.get_mut(identity)
        } else {
            None
        }
    }

    pub fn clear(&mut self, partition: Partition) {
        self.list_mut(partition).clear();
    }

    /// Identities of one partition in insertion order.
    pub fn identities(&self, partition: Partition) -> Vec<DeviceIdentity> {
        self.list(partition).clone()
    }

    /// Identities in any active partition, in partition-then-insertion order.
    pub fn active_identities(&self) -> Vec<DeviceIdentity> {
        Partition::active()
            .into_iter()
            .flat_map(|p| self.list(p).iter().copied().collect::<Vec<_>>())
            .collect()
    }

    pub fn len(&self, partition: Partition) -> usize {
        self.list(partition).len()
    }

    pub fn is_empty(&self, partition: Partition) -> bool {
        self.list(partition).is_empty()
    }

    /// Evict an identity from every partition and drop its session.
    pub fn evict(&mut self, identity: &DeviceIdentity) -> Option<DeviceSession> {
        self.scanned.retain(|id| id != identity);
        self.connecting.retain(|id| id != identity);
        self.connected.retain(|id| id != identity);
        self.disconnecting.retain(|id| id != identity);
        self.sessions.remove(identity)
    }
}
