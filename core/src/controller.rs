//! Session controller — the connection and data-transfer state machine.
//!
//! One spawned task owns the registry, every session and the sinks, and
//! drains three channels in a `tokio::select!` loop: application commands,
//! transport events and watchdog expiries. That task is the serialized
//! execution context of the whole crate: no two mutations of the same
//! session's phase ever interleave, and cleanup always happens before the
//! matching sink notification.
//!
//! [`SessionManager`] is the cloneable handle. State-changing entry points
//! are fire-and-forget; completion and failure are observed through the
//! sinks. There is no process-wide instance: every `spawn` produces an
//! independent manager with its own registry and transport handle.

use crate::config::LinkTimeouts;
use crate::error::LinkError;
use crate::events::{DeviceSink, GlobalSink};
use crate::profile::ProfileTable;
use crate::registry::{DeviceRegistry, Partition};
use crate::session::{DeviceIdentity, DeviceSession, Phase, SessionSnapshot};
use crate::timer::{WatchdogExpiry, WatchdogPhase, WatchdogTimer};
use crate::transport::{TransportAdapter, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Commands accepted by the controller task.
enum Command {
    ScanStart,
    ScanStop,
    Connect {
        identity: DeviceIdentity,
    },
    Send {
        identity: DeviceIdentity,
        bytes: Vec<u8>,
    },
    Disconnect {
        identity: DeviceIdentity,
    },
    SetTimeout {
        name: String,
        value: Duration,
        reply: mpsc::Sender<Result<(), LinkError>>,
    },
    GetTimeout {
        name: String,
        reply: mpsc::Sender<Result<Duration, LinkError>>,
    },
    ListDevices {
        partition: Partition,
        reply: mpsc::Sender<Vec<SessionSnapshot>>,
    },
    Shutdown,
}

/// Handle to a running session controller.
#[derive(Clone)]
pub struct SessionManager {
    command_tx: mpsc::UnboundedSender<Command>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl SessionManager {
    /// Spawn a controller task and return its handle.
    ///
    /// `global_sink` receives scan- and adapter-scoped events,
    /// `device_sink` the per-device ones; one object may serve both roles.
    pub fn spawn(
        transport: Arc<dyn TransportAdapter>,
        profiles: ProfileTable,
        timeouts: LinkTimeouts,
        global_sink: Arc<dyn GlobalSink>,
        device_sink: Arc<dyn DeviceSink>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();

        let controller = Controller {
            transport,
            profiles,
            timeouts,
            registry: DeviceRegistry::new(),
            global_sink,
            device_sink,
            expiry_tx,
            scanning: false,
            ready: true,
        };
        tokio::spawn(controller.run(command_rx, event_rx, expiry_rx));

        Self {
            command_tx,
            event_tx,
        }
    }

    /// Sender the transport adapter reports its events on.
    pub fn transport_events(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.event_tx.clone()
    }

    pub fn scan_start(&self) {
        let _ = self.command_tx.send(Command::ScanStart);
    }

    pub fn scan_stop(&self) {
        let _ = self.command_tx.send(Command::ScanStop);
    }

    /// Request a connection. Outcome arrives as `device_connected` /
    /// `device_connect_error` on the device sink.
    pub fn connect(&self, identity: DeviceIdentity) {
        let _ = self.command_tx.send(Command::Connect { identity });
    }

    /// Queue a command for a ready device. The profile's terminator is
    /// appended on the wire; do not include it in `bytes`.
    pub fn send(&self, identity: DeviceIdentity, bytes: impl Into<Vec<u8>>) {
        let _ = self.command_tx.send(Command::Send {
            identity,
            bytes: bytes.into(),
        });
    }

    /// Request a disconnect. Aborts any in-progress transfer.
    pub fn disconnect(&self, identity: DeviceIdentity) {
        let _ = self.command_tx.send(Command::Disconnect { identity });
    }

    pub async fn set_timeout(&self, name: &str, value: Duration) -> Result<(), LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::SetTimeout {
                name: name.to_string(),
                value,
                reply: reply_tx,
            })
            .map_err(|_| LinkError::Transport("session controller not running".to_string()))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| LinkError::Transport("no reply from controller".to_string()))?
    }

    pub async fn get_timeout(&self, name: &str) -> Result<Duration, LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::GetTimeout {
                name: name.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| LinkError::Transport("session controller not running".to_string()))?;
        reply_rx
            .recv()
            .await
            .ok_or_else(|| LinkError::Transport("no reply from controller".to_string()))?
    }

    /// Snapshots of one registry partition, in insertion order.
    pub async fn devices(&self, partition: Partition) -> Vec<SessionSnapshot> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        if self
            .command_tx
            .send(Command::ListDevices {
                partition,
                reply: reply_tx,
            })
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.recv().await.unwrap_or_default()
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }
}

struct Controller {
    transport: Arc<dyn TransportAdapter>,
    profiles: ProfileTable,
    timeouts: LinkTimeouts,
    registry: DeviceRegistry,
    global_sink: Arc<dyn GlobalSink>,
    device_sink: Arc<dyn DeviceSink>,
    expiry_tx: mpsc::UnboundedSender<WatchdogExpiry>,
    scanning: bool,
    ready: bool,
}

impl Controller {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut event_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut expiry_rx: mpsc::UnboundedReceiver<WatchdogExpiry>,
    ) {
        info!("session controller started");
        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = event_rx.recv() => self.handle_transport_event(event).await,
                Some(expiry) = expiry_rx.recv() => self.handle_expiry(expiry).await,
            }
        }
        info!("session controller stopped");
    }

    /// Snapshot for sink delivery; synthesizes a bare one for identities
    /// the registry no longer (or never) holds.
    fn snapshot_of(&self, identity: &DeviceIdentity) -> SessionSnapshot {
        match self.registry.session(identity) {
            Some(session) => session.snapshot(),
            None => SessionSnapshot {
                identity: *identity,
                name: None,
                phase: Phase::Idle,
                profile: None,
            },
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::ScanStart => self.handle_scan_start().await,
            Command::ScanStop => self.handle_scan_stop().await,
            Command::Connect { identity } => self.handle_connect(identity).await,
            Command::Send { identity, bytes } => self.handle_send(identity, bytes).await,
            Command::Disconnect { identity } => self.handle_disconnect(identity).await,
            Command::SetTimeout { name, value, reply } => {
                let result = self.timeouts.set(&name, value);
                let _ = reply.send(result).await;
            }
            Command::GetTimeout { name, reply } => {
                let _ = reply.send(self.timeouts.get(&name)).await;
            }
            Command::ListDevices { partition, reply } => {
                let snapshots = self
                    .registry
                    .identities(partition)
                    .iter()
                    .map(|id| self.snapshot_of(id))
                    .collect();
                let _ = reply.send(snapshots).await;
            }
            Command::Shutdown => return false,
        }
        true
    }

    async fn handle_scan_start(&mut self) {
        if self.scanning {
            debug!("scan already running");
            return;
        }
        if !self.ready {
            self.global_sink
                .scan_error(&LinkError::BluetoothNotReadyOrLost);
            return;
        }
        match self.transport.scan_start().await {
            Ok(()) => {
                self.scanning = true;
                self.global_sink.scan_began();
            }
            Err(e) => self
                .global_sink
                .scan_error(&LinkError::Transport(e.to_string())),
        }
    }

    async fn handle_scan_stop(&mut self) {
        if !self.scanning {
            debug!("no scan to stop");
            return;
        }
        self.scanning = false;
        if let Err(e) = self.transport.scan_stop().await {
            self.global_sink
                .scan_error(&LinkError::Transport(e.to_string()));
        }
        self.global_sink.scan_ended();
    }

    async fn handle_connect(&mut self, identity: DeviceIdentity) {
        if self.scanning {
            let snap = self.snapshot_of(&identity);
            self.device_sink
                .device_error(&snap, &LinkError::UnableToPerformDuringScan);
            return;
        }
        let conflict = match self.registry.active_partition_of(&identity) {
            Some(Partition::Connecting) => Some(LinkError::AlreadyConnecting),
            Some(Partition::Connected) => Some(LinkError::AlreadyConnected),
            Some(Partition::Disconnecting) => Some(LinkError::AlreadyDisconnecting),
            _ => None,
        };
        if let Some(error) = conflict {
            let snap = self.snapshot_of(&identity);
            self.device_sink.device_connect_error(&snap, &error);
            return;
        }

        // A fresh identity gets a session on the spot; connecting does not
        // require the device to have been scanned first.
        if !self.registry.has_session(&identity) {
            let timer = WatchdogTimer::new(identity, self.expiry_tx.clone());
            self.registry
                .insert_session(DeviceSession::new(identity, None, timer));
        }
        let connect_deadline = self.timeouts.connect;
        if let Some(session) = self.registry.session_mut(&identity) {
            session.reset_transfer();
            session.set_phase(Phase::Connecting);
            session
                .timer_mut()
                .schedule(WatchdogPhase::Connect, connect_deadline);
        }
        self.registry.add(Partition::Connecting, identity);

        if let Err(e) = self.transport.connect(identity).await {
            if let Some(session) = self.registry.session_mut(&identity) {
                session.reset();
                session.set_phase(Phase::Idle);
            }
            self.registry.remove(Partition::Connecting, &identity);
            let snap = self.snapshot_of(&identity);
            self.device_sink
                .device_connect_error(&snap, &LinkError::Transport(e.to_string()));
        }
    }

    async fn handle_send(&mut self, identity: DeviceIdentity, bytes: Vec<u8>) {
        if self.scanning {
            let snap = self.snapshot_of(&identity);
            self.device_sink
                .device_error(&snap, &LinkError::UnableToPerformDuringScan);
            return;
        }
        if !self.registry.contains(Partition::Connected, &identity) {
            let snap = self.snapshot_of(&identity);
            self.device_sink
                .device_write_error(&snap, &LinkError::NotConnected);
            return;
        }

        let precondition = {
            let session = match self.registry.session_mut(&identity) {
                Some(session) => session,
                None => return,
            };
            if session.phase().is_sending() {
                Err(LinkError::SendingDataAlready)
            } else if session.phase().is_waiting_answer() {
                Err(LinkError::WaitingCommandAnswer)
            } else if !session.is_link_ready() {
                Err(LinkError::DeviceNotReady)
            } else {
                // Terminator goes on the wire with the payload.
                let terminator = session
                    .profile()
                    .map(|p| p.terminator.clone())
                    .unwrap_or_default();
                session.stage_outbound(&bytes, &terminator);
                session.set_phase(Phase::Sending);
                Ok(())
            }
        };
        match precondition {
            Ok(()) => self.write_next_fragment(identity).await,
            Err(error) => {
                let snap = self.snapshot_of(&identity);
                self.device_sink.device_write_error(&snap, &error);
            }
        }
    }

    /// Write the next unacknowledged fragment and arm its ack watchdog.
    /// The first fragment of a message gets the shorter deadline.
    async fn write_next_fragment(&mut self, identity: DeviceIdentity) {
        let first_deadline = self.timeouts.first_send_ack;
        let steady_deadline = self.timeouts.send_ack;
        let staged = {
            let session = match self.registry.session_mut(&identity) {
                Some(session) => session,
                None => return,
            };
            let (max, characteristic) = match (session.profile(), session.write_channel()) {
                (Some(profile), Some(characteristic)) => {
                    (profile.max_fragment_size, characteristic)
                }
                _ => return,
            };
            let fragment = match session.next_fragment(max) {
                Some(fragment) => fragment.to_vec(),
                None => return,
            };
            let deadline = if session.is_first_fragment() {
                first_deadline
            } else {
                steady_deadline
            };
            session.mark_in_flight(fragment.len());
            session.set_phase(Phase::AwaitingSendAck);
            session
                .timer_mut()
                .schedule(WatchdogPhase::SendAck, deadline);
            (fragment, characteristic)
        };

        let (fragment, characteristic) = staged;
        if let Err(e) = self
            .transport
            .write_fragment(identity, characteristic, fragment)
            .await
        {
            self.abort_send(identity, LinkError::Transport(e.to_string()));
        }
    }

    /// Tear down an in-flight send and report. No auto-retry: the caller
    /// must re-issue the command.
    fn abort_send(&mut self, identity: DeviceIdentity, error: LinkError) {
        if let Some(session) = self.registry.session_mut(&identity) {
            session.timer_mut().cancel();
            session.reset_transfer();
            session.set_phase(Phase::Ready);
        }
        let snap = self.snapshot_of(&identity);
        self.device_sink.device_write_error(&snap, &error);
    }

    async fn handle_disconnect(&mut self, identity: DeviceIdentity) {
        if self.scanning {
            let snap = self.snapshot_of(&identity);
            self.device_sink
                .device_error(&snap, &LinkError::UnableToPerformDuringScan);
            return;
        }
        let conflict = match self.registry.active_partition_of(&identity) {
            Some(Partition::Disconnecting) => Some(LinkError::AlreadyDisconnecting),
            Some(Partition::Connected) => None,
            _ => Some(LinkError::NotConnected),
        };
        if let Some(error) = conflict {
            let snap = self.snapshot_of(&identity);
            self.device_sink.device_error(&snap, &error);
            return;
        }

        // Best-effort teardown bounded by the connect deadline.
        let deadline = self.timeouts.connect;
        if let Some(session) = self.registry.session_mut(&identity) {
            session.reset_transfer();
            session.set_phase(Phase::Disconnecting);
            session
                .timer_mut()
                .schedule(WatchdogPhase::Disconnect, deadline);
        }
        self.registry.add(Partition::Disconnecting, identity);

        if let Err(e) = self.transport.disconnect(identity).await {
            // The watchdog still fires and finishes the cleanup.
            let snap = self.snapshot_of(&identity);
            self.device_sink
                .device_error(&snap, &LinkError::Transport(e.to_string()));
        }
    }

    // ------------------------------------------------------------------
    // Watchdog expirations
    // ------------------------------------------------------------------

    async fn handle_expiry(&mut self, expiry: WatchdogExpiry) {
        let identity = expiry.identity;
        let acknowledged = match self.registry.session_mut(&identity) {
            Some(session) => session.timer_mut().acknowledge(&expiry),
            None => false,
        };
        if !acknowledged {
            debug!(%identity, phase = ?expiry.phase, "stale watchdog expiry ignored");
            return;
        }
        debug!(%identity, phase = ?expiry.phase, "watchdog fired");
        match expiry.phase {
            WatchdogPhase::Connect => self.on_connect_timeout(identity).await,
            WatchdogPhase::SendAck => self.abort_send(identity, LinkError::SendingDataTimeout),
            WatchdogPhase::Response => self.on_response_deadline(identity),
            WatchdogPhase::Disconnect => self.on_disconnect_timeout(identity),
        }
    }

    async fn on_connect_timeout(&mut self, identity: DeviceIdentity) {
        let _ = self.transport.cancel_connect(identity).await;
        let snap = self.snapshot_of(&identity);
        if let Some(mut session) = self.registry.evict(&identity) {
            session.reset();
            session.set_phase(Phase::Terminated);
        }
        self.device_sink
            .device_connect_error(&snap, &LinkError::ConnectTimedOut);
    }

    /// The receive deadline elapsed. A terminated buffer is a completed
    /// response; anything else is a failed one, never a partial delivery.
    fn on_response_deadline(&mut self, identity: DeviceIdentity) {
        let outcome = {
            let session = match self.registry.session_mut(&identity) {
                Some(session) => session,
                None => return,
            };
            let terminated = session.inbound_terminated();
            let payload = session.take_inbound();
            session.set_phase(Phase::Ready);
            (terminated, payload, session.snapshot())
        };
        let (terminated, payload, snap) = outcome;
        if terminated {
            self.device_sink.received_data(&snap, &payload);
        } else {
            self.device_sink
                .device_read_error(&snap, &LinkError::ReceivingDataTimeout);
        }
    }

    /// Disconnect confirmation never came; the device is considered
    /// disconnected anyway. A confirmation arriving after this point no
    /// longer resolves to a session and is dropped.
    fn on_disconnect_timeout(&mut self, identity: DeviceIdentity) {
        let snap = self.snapshot_of(&identity);
        if let Some(mut session) = self.registry.evict(&identity) {
            session.reset();
        }
        self.device_sink
            .device_error(&snap, &LinkError::DisconnectTimedOut);
        self.device_sink.device_disconnected(&snap);
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        debug!(%event, "transport event");
        match event {
            TransportEvent::Discovered { identity, name } => self.on_discovered(identity, name),
            TransportEvent::Connected { identity } => self.on_connected(identity).await,
            TransportEvent::ConnectFailed { identity, reason } => {
                self.on_connect_failed(identity, reason)
            }
            TransportEvent::ServicesDiscovered { identity, services } => {
                self.on_services_discovered(identity, services).await
            }
            TransportEvent::CharacteristicsDiscovered {
                identity,
                service,
                characteristics,
            } => {
                self.on_characteristics_discovered(identity, service, characteristics)
                    .await
            }
            TransportEvent::WriteAck { identity } => self.on_write_ack(identity).await,
            TransportEvent::WriteError { identity, reason } => {
                self.on_write_error(identity, reason)
            }
            TransportEvent::DataReceived { identity, bytes } => {
                self.on_data_received(identity, bytes)
            }
            TransportEvent::Disconnected { identity, reason } => {
                self.on_disconnected(identity, reason)
            }
            TransportEvent::AvailabilityChanged { available } => {
                self.on_availability_changed(available)
            }
        }
    }

    fn on_discovered(&mut self, identity: DeviceIdentity, name: Option<String>) {
        if let Some(session) = self.registry.session_mut(&identity) {
            // Re-advertisement: refresh the name, report nothing.
            session.set_name(name);
            return;
        }
        let timer = WatchdogTimer::new(identity, self.expiry_tx.clone());
        self.registry
            .insert_session(DeviceSession::new(identity, name, timer));
        self.registry.add(Partition::Scanned, identity);
        let snap = self.snapshot_of(&identity);
        self.global_sink.device_found(&snap);
    }

    async fn on_connected(&mut self, identity: DeviceIdentity) {
        if !self.registry.contains(Partition::Connecting, &identity) {
            debug!(%identity, "unsolicited connect confirmation ignored");
            return;
        }
        if let Some(session) = self.registry.session_mut(&identity) {
            session.timer_mut().cancel();
            session.set_phase(Phase::Connected);
        }
        self.registry.add(Partition::Connected, identity);
        let snap = self.snapshot_of(&identity);
        self.device_sink.device_connected(&snap);

        if let Err(e) = self.transport.discover_services(identity).await {
            self.device_sink
                .device_error(&snap, &LinkError::Transport(e.to_string()));
        }
    }

    fn on_connect_failed(&mut self, identity: DeviceIdentity, reason: String) {
        if !self.registry.contains(Partition::Connecting, &identity) {
            debug!(%identity, "connect failure for unknown attempt ignored");
            return;
        }
        if let Some(session) = self.registry.session_mut(&identity) {
            session.reset();
            session.set_phase(Phase::Idle);
        }
        self.registry.remove(Partition::Connecting, &identity);
        let snap = self.snapshot_of(&identity);
        self.device_sink
            .device_connect_error(&snap, &LinkError::Transport(reason));
    }

    async fn on_services_discovered(&mut self, identity: DeviceIdentity, services: Vec<Uuid>) {
        if !self.registry.contains(Partition::Connected, &identity) {
            return;
        }
        let matched = services
            .iter()
            .find_map(|service| self.profiles.find_by_service(*service).cloned());
        let profile = match matched {
            Some(profile) => profile,
            None => {
                let snap = self.snapshot_of(&identity);
                self.device_sink
                    .device_error(&snap, &LinkError::UnsupportedDevice);
                return;
            }
        };
        let service = profile.service;
        debug!(%identity, family = %profile.family, "profile assigned");
        if let Some(session) = self.registry.session_mut(&identity) {
            session.set_profile(profile);
        }
        if let Err(e) = self
            .transport
            .discover_characteristics(identity, service)
            .await
        {
            let snap = self.snapshot_of(&identity);
            self.device_sink
                .device_error(&snap, &LinkError::Transport(e.to_string()));
        }
    }

    async fn on_characteristics_discovered(
        &mut self,
        identity: DeviceIdentity,
        service: Uuid,
        characteristics: Vec<Uuid>,
    ) {
        if !self.registry.contains(Partition::Connected, &identity) {
            return;
        }
        let resolved = {
            let session = match self.registry.session_mut(&identity) {
                Some(session) => session,
                None => return,
            };
            let profile = match session.profile() {
                Some(profile) if profile.service == service => profile.clone(),
                _ => return,
            };
            let mut subscribe = None;
            for characteristic in characteristics {
                if characteristic == profile.write_characteristic {
                    session.set_write_channel(characteristic);
                }
                if characteristic == profile.read_characteristic {
                    session.set_read_channel(characteristic);
                    subscribe = Some(characteristic);
                }
            }
            let ready = session.is_link_ready() && session.phase() == Phase::Connected;
            if ready {
                session.set_phase(Phase::Ready);
            }
            (subscribe, ready)
        };

        let (subscribe, ready) = resolved;
        if let Some(characteristic) = subscribe {
            if let Err(e) = self
                .transport
                .subscribe_notifications(identity, characteristic)
                .await
            {
                let snap = self.snapshot_of(&identity);
                self.device_sink
                    .device_error(&snap, &LinkError::Transport(e.to_string()));
                return;
            }
        }
        if ready {
            let snap = self.snapshot_of(&identity);
            self.device_sink.device_ready(&snap);
        }
    }

    async fn on_write_ack(&mut self, identity: DeviceIdentity) {
        let more = {
            let session = match self.registry.find_active_mut(&identity) {
                Some(session) => session,
                None => {
                    debug!(%identity, "write ack for unknown session ignored");
                    return;
                }
            };
            if session.phase() != Phase::AwaitingSendAck {
                debug!(%identity, phase = ?session.phase(), "unexpected write ack ignored");
                return;
            }
            session.timer_mut().cancel();
            session.acknowledge_fragment()
        };

        if more {
            if let Some(session) = self.registry.session_mut(&identity) {
                session.set_phase(Phase::Sending);
            }
            self.write_next_fragment(identity).await;
        } else {
            // Whole message on the wire: switch to waiting for the answer.
            let deadline = self.timeouts.first_response;
            if let Some(session) = self.registry.session_mut(&identity) {
                session.clear_outbound();
                session.set_phase(Phase::AwaitingResponse);
                session
                    .timer_mut()
                    .schedule(WatchdogPhase::Response, deadline);
            }
        }
    }

    fn on_write_error(&mut self, identity: DeviceIdentity, reason: String) {
        let in_send = self
            .registry
            .find_active(&identity)
            .map(|s| s.phase() == Phase::AwaitingSendAck)
            .unwrap_or(false);
        if !in_send {
            debug!(%identity, "write error outside send ignored");
            return;
        }
        self.abort_send(identity, LinkError::Transport(reason));
    }

    fn on_data_received(&mut self, identity: DeviceIdentity, bytes: Vec<u8>) {
        let inter_fragment = self.timeouts.inter_fragment_response;
        let passive = {
            let session = match self.registry.find_active_mut(&identity) {
                Some(session) => session,
                None => {
                    debug!(%identity, "data for unknown session dropped");
                    return;
                }
            };
            session.append_inbound(&bytes);
            if session.timer().armed_phase() == Some(WatchdogPhase::Response) {
                // An answer is expected: every fragment pushes the deadline
                // out, bounding inter-fragment gaps rather than total time.
                session.set_phase(Phase::Receiving);
                session
                    .timer_mut()
                    .schedule(WatchdogPhase::Response, inter_fragment);
                None
            } else if session.timer().is_armed() {
                // Mid-send chatter accumulates and rides out with the
                // response once the send completes.
                None
            } else {
                let payload = session.take_inbound();
                Some((payload, session.snapshot()))
            }
        };
        if let Some((payload, snap)) = passive {
            self.device_sink.received_data(&snap, &payload);
        }
    }

    fn on_disconnected(&mut self, identity: DeviceIdentity, reason: Option<String>) {
        let partition = match self.registry.active_partition_of(&identity) {
            Some(partition) => partition,
            None => {
                debug!(%identity, "late disconnect confirmation ignored");
                return;
            }
        };
        let requested = partition == Partition::Disconnecting;
        let snap = self.snapshot_of(&identity);
        if let Some(mut session) = self.registry.evict(&identity) {
            session.reset();
            session.set_phase(Phase::Terminated);
        }
        if !requested {
            if let Some(reason) = reason {
                self.device_sink
                    .device_error(&snap, &LinkError::Transport(reason));
            }
        }
        self.device_sink.device_disconnected(&snap);
    }

    /// Adapter availability flipped. Loss force-terminates every session,
    /// whatever its phase, and reports the loss once.
    fn on_availability_changed(&mut self, available: bool) {
        if available {
            self.ready = true;
            return;
        }
        let was_ready = self.ready;
        self.ready = false;
        if self.scanning {
            self.scanning = false;
            self.global_sink.scan_ended();
        }
        for identity in self.registry.active_identities() {
            let snap = self.snapshot_of(&identity);
            if let Some(mut session) = self.registry.evict(&identity) {
                session.reset();
            }
            self.device_sink.device_disconnected(&snap);
        }
        for identity in self.registry.identities(Partition::Scanned) {
            self.registry.evict(&identity);
        }
        if was_ready {
            self.global_sink
                .adapter_error(&LinkError::BluetoothNotReadyOrLost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::transport::{MockTransportAdapter, TransportError};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingGlobalSink {
        entries: Mutex<Vec<String>>,
    }

    impl GlobalSink for RecordingGlobalSink {
        fn scan_began(&self) {
            self.entries.lock().push("scan_began".to_string());
        }
        fn scan_ended(&self) {
            self.entries.lock().push("scan_ended".to_string());
        }
        fn scan_error(&self, error: &LinkError) {
            self.entries.lock().push(format!("scan_error:{}", error.code()));
        }
        fn device_found(&self, device: &SessionSnapshot) {
            self.entries
                .lock()
                .push(format!("device_found:{}", device.identity));
        }
    }

    async fn settle(manager: &SessionManager) {
        // Commands are processed in order; a round-tripped query proves
        // everything queued before it has been handled.
        let _ = manager.devices(Partition::Scanned).await;
    }

    #[tokio::test]
    async fn test_scan_start_error_reaches_global_sink() {
        let mut mock = MockTransportAdapter::new();
        mock.expect_scan_start()
            .times(1)
            .returning(|| Err(TransportError::AdapterUnavailable));

        let sink = Arc::new(RecordingGlobalSink::default());
        let manager = SessionManager::spawn(
            Arc::new(mock),
            ProfileTable::builtin(),
            LinkTimeouts::default(),
            sink.clone(),
            Arc::new(NullSink),
        );

        manager.scan_start();
        settle(&manager).await;

        let entries = sink.entries.lock().clone();
        assert_eq!(entries, vec!["scan_error:TRANSPORT_ERROR".to_string()]);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_scan_lifecycle_and_duplicate_start() {
        let mut mock = MockTransportAdapter::new();
        mock.expect_scan_start().times(1).returning(|| Ok(()));
        mock.expect_scan_stop().times(1).returning(|| Ok(()));

        let sink = Arc::new(RecordingGlobalSink::default());
        let manager = SessionManager::spawn(
            Arc::new(mock),
            ProfileTable::builtin(),
            LinkTimeouts::default(),
            sink.clone(),
            Arc::new(NullSink),
        );

        manager.scan_start();
        manager.scan_start(); // duplicate: logged no-op, no transport call
        manager.scan_stop();
        settle(&manager).await;

        let entries = sink.entries.lock().clone();
        assert_eq!(
            entries,
            vec!["scan_began".to_string(), "scan_ended".to_string()]
        );
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_discovery_creates_session_once() {
        let mock = MockTransportAdapter::new();
        let sink = Arc::new(RecordingGlobalSink::default());
        let manager = SessionManager::spawn(
            Arc::new(mock),
            ProfileTable::builtin(),
            LinkTimeouts::default(),
            sink.clone(),
            Arc::new(NullSink),
        );

        let identity = DeviceIdentity::random();
        let events = manager.transport_events();
        events
            .send(TransportEvent::Discovered {
                identity,
                name: Some("probe".to_string()),
            })
            .expect("controller running");
        events
            .send(TransportEvent::Discovered {
                identity,
                name: Some("probe".to_string()),
            })
            .expect("controller running");

        // Events ride a separate channel from queries; poll until the
        // discovery lands, then give the re-advertisement time to follow.
        let mut scanned = Vec::new();
        for _ in 0..200 {
            scanned = manager.devices(Partition::Scanned).await;
            if !scanned.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sink.entries.lock().len(), 1, "one device_found per identity");
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].name.as_deref(), Some("probe"));
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_timeout_config_roundtrip() {
        let mock = MockTransportAdapter::new();
        let manager = SessionManager::spawn(
            Arc::new(mock),
            ProfileTable::builtin(),
            LinkTimeouts::default(),
            Arc::new(NullSink),
            Arc::new(NullSink),
        );

        assert_eq!(
            manager.get_timeout("connect").await.expect("known name"),
            Duration::from_secs(20)
        );
        manager
            .set_timeout("connect", Duration::from_millis(50))
            .await
            .expect("known name");
        assert_eq!(
            manager.get_timeout("connect").await.expect("known name"),
            Duration::from_millis(50)
        );
        let err = manager
            .set_timeout("warmup", Duration::from_secs(1))
            .await
            .expect_err("unknown name");
        assert_eq!(err.code(), "UNKNOWN_TIMEOUT");
        manager.shutdown();
    }
}
