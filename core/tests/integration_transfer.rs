// Integration tests for chunked send and terminator-based receive,
// driven against a simulated serial-over-GATT peripheral.

use async_trait::async_trait;
use parking_lot::Mutex;
use perch_core::{
    DeviceIdentity, DeviceSink, GlobalSink, LinkError, LinkTimeouts, Partition, Phase,
    ProfileTable, SessionManager, SessionSnapshot, TransportAdapter, TransportError,
    TransportEvent,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Simulated peripheral speaking the Nordic UART profile. Connection and
/// discovery always succeed; write handling is configurable: acknowledge
/// or stay silent, and once a full terminated command has been received,
/// push back the configured response fragments.
struct SimPeripheral {
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    ack_writes: bool,
    response: Vec<Vec<u8>>,
    written: Mutex<Vec<Vec<u8>>>,
    command: Mutex<Vec<u8>>,
}

impl SimPeripheral {
    fn new(ack_writes: bool, response: Vec<Vec<u8>>) -> Self {
        Self {
            events: Mutex::new(None),
            ack_writes,
            response,
            written: Mutex::new(Vec::new()),
            command: Mutex::new(Vec::new()),
        }
    }

    fn attach(&self, tx: mpsc::UnboundedSender<TransportEvent>) {
        *self.events.lock() = Some(tx);
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl TransportAdapter for SimPeripheral {
    async fn scan_start(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn scan_stop(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(&self, identity: DeviceIdentity) -> Result<(), TransportError> {
        self.emit(TransportEvent::Connected { identity });
        Ok(())
    }

    async fn cancel_connect(&self, _identity: DeviceIdentity) -> Result<(), TransportError> {
        Ok(())
    }

    async fn discover_services(&self, identity: DeviceIdentity) -> Result<(), TransportError> {
        self.emit(TransportEvent::ServicesDiscovered {
            identity,
            services: vec![Uuid::from_u128(perch_core::profile::NUS_SERVICE_UUID)],
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        identity: DeviceIdentity,
        service: Uuid,
    ) -> Result<(), TransportError> {
        self.emit(TransportEvent::CharacteristicsDiscovered {
            identity,
            service,
            characteristics: vec![
                Uuid::from_u128(perch_core::profile::NUS_WRITE_UUID),
                Uuid::from_u128(perch_core::profile::NUS_NOTIFY_UUID),
            ],
        });
        Ok(())
    }

    async fn write_fragment(
        &self,
        identity: DeviceIdentity,
        _characteristic: Uuid,
        bytes: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.written.lock().push(bytes.clone());
        if !self.ack_writes {
            return Ok(());
        }
        self.emit(TransportEvent::WriteAck { identity });

        let complete = {
            let mut command = self.command.lock();
            command.extend_from_slice(&bytes);
            if command.ends_with(b"\r\n") {
                command.clear();
                true
            } else {
                false
            }
        };
        if complete {
            for fragment in &self.response {
                self.emit(TransportEvent::DataReceived {
                    identity,
                    bytes: fragment.clone(),
                });
            }
        }
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
        self.emit(TransportEvent::Disconnected {
            identity,
            reason: None,
        });
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    entries: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, entry: String) {
        self.entries.lock().push(entry);
    }

    fn count(&self, needle: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.contains(needle))
            .count()
    }
}

impl GlobalSink for Recorder {}

impl DeviceSink for Recorder {
    fn device_ready(&self, device: &SessionSnapshot) {
        self.push(format!("device_ready:{}", device.identity));
    }
    fn received_data(&self, _device: &SessionSnapshot, bytes: &[u8]) {
        self.push(format!("received_data:{}", String::from_utf8_lossy(bytes)));
    }
    fn device_write_error(&self, _device: &SessionSnapshot, error: &LinkError) {
        self.push(format!("device_write_error:{}", error.code()));
    }
    fn device_read_error(&self, _device: &SessionSnapshot, error: &LinkError) {
        self.push(format!("device_read_error:{}", error.code()));
    }
    fn device_error(&self, _device: &SessionSnapshot, error: &LinkError) {
        self.push(format!("device_error:{}", error.code()));
    }
    fn device_disconnected(&self, device: &SessionSnapshot) {
        self.push(format!("device_disconnected:{}", device.identity));
    }
}

async fn wait_for(recorder: &Recorder, needle: &str) {
    wait_for_count(recorder, needle, 1).await;
}

async fn wait_for_count(recorder: &Recorder, needle: &str, count: usize) {
    for _ in 0..400 {
        if recorder.count(needle) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "timed out waiting for {count}x {needle:?}; recorded: {:?}",
        recorder.entries.lock()
    );
}

async fn wait_for_writes(peripheral: &SimPeripheral, count: usize) {
    for _ in 0..400 {
        if peripheral.written().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {count} writes");
}

/// Short receive deadlines so completed responses settle quickly.
fn fast_timeouts() -> LinkTimeouts {
    LinkTimeouts::default()
        .with_first_response(Duration::from_millis(200))
        .with_inter_fragment_response(Duration::from_millis(40))
}

async fn ready_device(
    peripheral: Arc<SimPeripheral>,
    recorder: Arc<Recorder>,
) -> (SessionManager, DeviceIdentity) {
    let manager = SessionManager::spawn(
        peripheral.clone(),
        ProfileTable::builtin(),
        fast_timeouts(),
        recorder.clone(),
        recorder.clone(),
    );
    peripheral.attach(manager.transport_events());

    let identity = DeviceIdentity::random();
    manager.connect(identity);
    wait_for(&recorder, "device_ready").await;
    (manager, identity)
}

#[tokio::test]
async fn test_single_fragment_ping_pong() {
    let peripheral = Arc::new(SimPeripheral::new(true, vec![b"PONG\r\n".to_vec()]));
    let recorder = Arc::new(Recorder::default());
    let (manager, identity) = ready_device(peripheral.clone(), recorder.clone()).await;

    manager.send(identity, b"PING".to_vec());
    wait_for(&recorder, "received_data").await;

    // 4-byte payload + terminator fits a single 20-byte fragment.
    assert_eq!(peripheral.written(), vec![b"PING\r\n".to_vec()]);
    // The terminator is delivered intact, never trimmed.
    assert_eq!(recorder.count("received_data:PONG\r\n"), 1);

    // The session is back in Ready and accepts the next command.
    let connected = manager.devices(Partition::Connected).await;
    assert_eq!(connected[0].phase, Phase::Ready);
    manager.shutdown();
}

#[tokio::test]
async fn test_chunked_send_covers_payload_exactly_once() {
    let peripheral = Arc::new(SimPeripheral::new(true, vec![b"OK\r\n".to_vec()]));
    let recorder = Arc::new(Recorder::default());
    let (manager, identity) = ready_device(peripheral.clone(), recorder.clone()).await;

    let payload = vec![0xAB; 45];
    manager.send(identity, payload.clone());
    wait_for(&recorder, "received_data").await;

    let written = peripheral.written();
    assert_eq!(written.len(), 3, "47 bytes at fragment size 20");
    for fragment in &written {
        assert!(fragment.len() <= 20);
    }
    let mut expected = payload;
    expected.extend_from_slice(b"\r\n");
    assert_eq!(written.concat(), expected);
    manager.shutdown();
}

#[tokio::test]
async fn test_send_rejected_while_send_in_progress() {
    // Writes are never acknowledged: the first send stalls awaiting its ack.
    let peripheral = Arc::new(SimPeripheral::new(false, Vec::new()));
    let recorder = Arc::new(Recorder::default());
    let (manager, identity) = ready_device(peripheral.clone(), recorder.clone()).await;

    manager.send(identity, b"FIRST".to_vec());
    manager.send(identity, b"SECOND".to_vec());
    wait_for(&recorder, "SENDING_DATA_ALREADY").await;

    // The stalled send eventually fails on its ack watchdog.
    wait_for(&recorder, "SENDING_DATA_TIMEOUT").await;
    assert_eq!(peripheral.written().len(), 1, "second payload never staged");

    // After the failure the session accepts commands again.
    manager.send(identity, b"THIRD".to_vec());
    wait_for_count(&recorder, "SENDING_DATA_TIMEOUT", 2).await;
    assert_eq!(peripheral.written().len(), 2);
    manager.shutdown();
}

#[tokio::test]
async fn test_send_rejected_while_awaiting_answer() {
    // Acks arrive but the peripheral never answers.
    let peripheral = Arc::new(SimPeripheral::new(true, Vec::new()));
    let recorder = Arc::new(Recorder::default());
    let (manager, identity) = ready_device(peripheral.clone(), recorder.clone()).await;

    manager.send(identity, b"STATUS".to_vec());
    // Give the ack time to land so the session is waiting for the answer.
    tokio::time::sleep(Duration::from_millis(40)).await;
    manager.send(identity, b"RESET".to_vec());
    wait_for(&recorder, "WAITING_COMMAND_ANSWER").await;

    // The silent answer trips the receive watchdog with an empty buffer.
    wait_for(&recorder, "RECEIVING_DATA_TIMEOUT").await;
    assert_eq!(recorder.count("received_data"), 0);
    manager.shutdown();
}

#[tokio::test]
async fn test_unterminated_response_fails_not_partially_delivered() {
    let peripheral = Arc::new(SimPeripheral::new(true, vec![b"PON".to_vec()]));
    let recorder = Arc::new(Recorder::default());
    let (manager, identity) = ready_device(peripheral.clone(), recorder.clone()).await;

    manager.send(identity, b"PING".to_vec());
    wait_for(&recorder, "RECEIVING_DATA_TIMEOUT").await;

    assert_eq!(recorder.count("received_data"), 0);

    // The accumulation buffer was cleared: a later complete exchange
    // delivers only its own bytes.
    let connected = manager.devices(Partition::Connected).await;
    assert_eq!(connected[0].phase, Phase::Ready);
    manager.shutdown();
}

#[tokio::test]
async fn test_fragmented_response_reassembled() {
    let peripheral = Arc::new(SimPeripheral::new(
        true,
        vec![b"PO".to_vec(), b"NG\r".to_vec(), b"\n".to_vec()],
    ));
    let recorder = Arc::new(Recorder::default());
    let (manager, identity) = ready_device(peripheral.clone(), recorder.clone()).await;

    manager.send(identity, b"PING".to_vec());
    wait_for(&recorder, "received_data").await;

    assert_eq!(recorder.count("received_data:PONG\r\n"), 1);
    manager.shutdown();
}

#[tokio::test]
async fn test_passive_receive_delivered_immediately() {
    let peripheral = Arc::new(SimPeripheral::new(true, Vec::new()));
    let recorder = Arc::new(Recorder::default());
    let (manager, identity) = ready_device(peripheral.clone(), recorder.clone()).await;

    // No command outstanding: unsolicited bytes go straight to the sink.
    peripheral.emit(TransportEvent::DataReceived {
        identity,
        bytes: b"ALERT 7".to_vec(),
    });
    wait_for(&recorder, "received_data:ALERT 7").await;
    manager.shutdown();
}

#[tokio::test]
async fn test_send_requires_connection() {
    let peripheral = Arc::new(SimPeripheral::new(true, Vec::new()));
    let recorder = Arc::new(Recorder::default());
    let manager = SessionManager::spawn(
        peripheral.clone(),
        ProfileTable::builtin(),
        fast_timeouts(),
        recorder.clone(),
        recorder.clone(),
    );
    peripheral.attach(manager.transport_events());

    manager.send(DeviceIdentity::random(), b"PING".to_vec());
    wait_for(&recorder, "device_write_error:NOT_CONNECTED").await;
    manager.shutdown();
}

#[tokio::test]
async fn test_write_error_aborts_send() {
    let peripheral = Arc::new(SimPeripheral::new(false, Vec::new()));
    let recorder = Arc::new(Recorder::default());
    let (manager, identity) = ready_device(peripheral.clone(), recorder.clone()).await;

    manager.send(identity, b"PING".to_vec());
    wait_for_writes(&peripheral, 1).await;
    peripheral.emit(TransportEvent::WriteError {
        identity,
        reason: "characteristic write rejected".to_string(),
    });
    wait_for(&recorder, "device_write_error:TRANSPORT_ERROR").await;

    // Back to Ready, no timeout error follows from the replaced watchdog.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.count("SENDING_DATA_TIMEOUT"), 0);
    let connected = manager.devices(Partition::Connected).await;
    assert_eq!(connected[0].phase, Phase::Ready);
    manager.shutdown();
}

proptest! {
    // For any payload and fragment size, the fragments written cover
    // payload + terminator exactly once, every fragment within bounds.
    #[test]
    fn prop_fragment_walk_covers_buffer_exactly_once(
        payload in proptest::collection::vec(any::<u8>(), 0..200),
        max in 1usize..64,
    ) {
        use perch_core::session::DeviceSession;
        use perch_core::timer::WatchdogTimer;

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let identity = DeviceIdentity::random();
        let mut session = DeviceSession::new(identity, None, WatchdogTimer::new(identity, tx));
        session.stage_outbound(&payload, b"\r\n");

        let mut written = Vec::new();
        while let Some(fragment) = session.next_fragment(max) {
            prop_assert!(fragment.len() <= max);
            prop_assert!(!fragment.is_empty());
            let fragment = fragment.to_vec();
            session.mark_in_flight(fragment.len());
            written.extend_from_slice(&fragment);
            session.acknowledge_fragment();
        }

        let mut expected = payload;
        expected.extend_from_slice(b"\r\n");
        prop_assert_eq!(written, expected);
    }
}
