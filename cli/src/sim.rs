//! In-process simulated peripheral for the `demo` subcommand.
//!
//! Speaks the Nordic UART profile and echoes every terminated command
//! back as its response, chunked into notification-sized fragments, with
//! a configurable link latency.

use async_trait::async_trait;
use perch_core::profile::{
    DEFAULT_FRAGMENT_SIZE, NUS_NOTIFY_UUID, NUS_SERVICE_UUID, NUS_WRITE_UUID,
};
use perch_core::{DeviceIdentity, TransportAdapter, TransportError, TransportEvent};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct SimPeripheral {
    identity: DeviceIdentity,
    name: String,
    latency: Duration,
    events: OnceLock<UnboundedSender<TransportEvent>>,
    command: Mutex<Vec<u8>>,
}

impl SimPeripheral {
    pub fn new(latency: Duration) -> Self {
        Self {
            identity: DeviceIdentity::random(),
            name: "perch-sim".to_string(),
            latency,
            events: OnceLock::new(),
            command: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    /// Wire the peripheral to a manager's event channel. One-shot.
    pub fn attach(&self, tx: UnboundedSender<TransportEvent>) {
        let _ = self.events.set(tx);
    }

    /// Emit a batch of events in order, after the simulated link latency.
    fn emit(&self, events: Vec<TransportEvent>) {
        let Some(tx) = self.events.get() else {
            return;
        };
        let tx = tx.clone();
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            for event in events {
                let _ = tx.send(event);
            }
        });
    }
}

#[async_trait]
impl TransportAdapter for SimPeripheral {
    async fn scan_start(&self) -> Result<(), TransportError> {
        self.emit(vec![TransportEvent::Discovered {
            identity: self.identity,
            name: Some(self.name.clone()),
        }]);
        Ok(())
    }

    async fn scan_stop(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(&self, identity: DeviceIdentity) -> Result<(), TransportError> {
        self.emit(vec![TransportEvent::Connected { identity }]);
        Ok(())
    }

    async fn cancel_connect(&self, _identity: DeviceIdentity) -> Result<(), TransportError> {
        Ok(())
    }

    async fn discover_services(&self, identity: DeviceIdentity) -> Result<(), TransportError> {
        self.emit(vec![TransportEvent::ServicesDiscovered {
            identity,
            services: vec![Uuid::from_u128(NUS_SERVICE_UUID)],
        }]);
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        identity: DeviceIdentity,
        service: Uuid,
    ) -> Result<(), TransportError> {
        self.emit(vec![TransportEvent::CharacteristicsDiscovered {
            identity,
            service,
            characteristics: vec![
                Uuid::from_u128(NUS_WRITE_UUID),
                Uuid::from_u128(NUS_NOTIFY_UUID),
            ],
        }]);
        Ok(())
    }

    async fn write_fragment(
        &self,
        identity: DeviceIdentity,
        _characteristic: Uuid,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut events = vec![TransportEvent::WriteAck { identity }];

        let mut command = self.command.lock().await;
        command.extend_from_slice(&bytes);
        if command.ends_with(b"\r\n") {
            // Echo the whole command back, notification-sized.
            let response = std::mem::take(&mut *command);
            for fragment in response.chunks(DEFAULT_FRAGMENT_SIZE) {
                events.push(TransportEvent::DataReceived {
                    identity,
                    bytes: fragment.to_vec(),
                });
            }
        }
        drop(command);

        self.emit(events);
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        _identity: DeviceIdentity,
        _characteristic: Uuid,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self, identity: DeviceIdentity) -> Result<(), TransportError> {
        self.emit(vec![TransportEvent::Disconnected {
            identity,
            reason: None,
        }]);
        Ok(())
    }
}
