// perch — command-line frontend for perch-core session management.

mod sim;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use perch_core::{
    DeviceSink, GlobalSink, LinkError, LinkTimeouts, ProfileTable, SessionManager,
    SessionSnapshot,
};
use sim::SimPeripheral;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Parser)]
#[command(name = "perch")]
#[command(about = "Session manager for serial-over-GATT peripherals", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in device profiles
    Profiles {
        /// Emit the table as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the watchdog timeout defaults
    Timeouts,
    /// Exchange commands with a simulated echo peripheral
    Demo {
        /// Command payload to send (terminator is appended on the wire)
        #[arg(short, long, default_value = "PING")]
        payload: String,
        /// Number of command/response exchanges
        #[arg(short, long, default_value = "1")]
        count: usize,
        /// Simulated link latency in milliseconds
        #[arg(long, default_value = "20")]
        latency_ms: u64,
    },
}

/// What the demo loop waits on, forwarded out of the sinks.
enum Notice {
    Ready,
    Data(Vec<u8>),
    Failed(LinkError),
    Disconnected,
}

struct ConsoleSink {
    notices: mpsc::UnboundedSender<Notice>,
}

impl GlobalSink for ConsoleSink {
    fn device_found(&self, device: &SessionSnapshot) {
        println!(
            "discovered {} ({})",
            device.identity,
            device.name.as_deref().unwrap_or("unnamed")
        );
    }

    fn scan_error(&self, error: &LinkError) {
        warn!(code = error.code(), "scan error: {error}");
    }

    fn adapter_error(&self, error: &LinkError) {
        warn!(code = error.code(), "adapter error: {error}");
    }
}

impl DeviceSink for ConsoleSink {
    fn device_connected(&self, device: &SessionSnapshot) {
        println!("connected {}", device.identity);
    }

    fn device_ready(&self, _device: &SessionSnapshot) {
        let _ = self.notices.send(Notice::Ready);
    }

    fn received_data(&self, _device: &SessionSnapshot, bytes: &[u8]) {
        let _ = self.notices.send(Notice::Data(bytes.to_vec()));
    }

    fn device_connect_error(&self, _device: &SessionSnapshot, error: &LinkError) {
        let _ = self.notices.send(Notice::Failed(error.clone()));
    }

    fn device_write_error(&self, _device: &SessionSnapshot, error: &LinkError) {
        let _ = self.notices.send(Notice::Failed(error.clone()));
    }

    fn device_read_error(&self, _device: &SessionSnapshot, error: &LinkError) {
        let _ = self.notices.send(Notice::Failed(error.clone()));
    }

    fn device_error(&self, _device: &SessionSnapshot, error: &LinkError) {
        let _ = self.notices.send(Notice::Failed(error.clone()));
    }

    fn device_disconnected(&self, device: &SessionSnapshot) {
        println!("disconnected {}", device.identity);
        let _ = self.notices.send(Notice::Disconnected);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Profiles { json } => print_profiles(json),
        Commands::Timeouts => {
            print_timeouts();
            Ok(())
        }
        Commands::Demo {
            payload,
            count,
            latency_ms,
        } => run_demo(payload, count, Duration::from_millis(latency_ms)).await,
    }
}

fn print_profiles(json: bool) -> Result<()> {
    let table = ProfileTable::builtin();
    if json {
        println!("{}", table.to_json().context("serializing profile table")?);
        return Ok(());
    }
    for profile in table.iter() {
        println!("{}", profile.family);
        println!("  service          {}", profile.service);
        println!("  write            {}", profile.write_characteristic);
        println!("  read             {}", profile.read_characteristic);
        println!("  terminator       0x{}", hex::encode(&profile.terminator));
        println!("  fragment size    {}", profile.max_fragment_size);
    }
    Ok(())
}

fn print_timeouts() {
    let timeouts = LinkTimeouts::default();
    for name in LinkTimeouts::names() {
        if let Ok(value) = timeouts.get(name) {
            println!("{name:<24} {value:?}");
        }
    }
}

async fn run_demo(payload: String, count: usize, latency: Duration) -> Result<()> {
    let (notices_tx, mut notices) = mpsc::unbounded_channel();
    let peripheral = Arc::new(SimPeripheral::new(latency));
    let sink = Arc::new(ConsoleSink {
        notices: notices_tx,
    });

    let manager = SessionManager::spawn(
        peripheral.clone(),
        ProfileTable::builtin(),
        LinkTimeouts::default(),
        sink.clone(),
        sink,
    );
    peripheral.attach(manager.transport_events());

    let identity = peripheral.identity();
    manager.connect(identity);
    match next_notice(&mut notices).await? {
        Notice::Ready => println!("ready {identity}"),
        Notice::Failed(error) => bail!("connect failed: {error}"),
        _ => bail!("unexpected event before the device became ready"),
    }

    for round in 1..=count {
        manager.send(identity, payload.as_bytes().to_vec());
        match next_notice(&mut notices).await? {
            Notice::Data(bytes) => println!(
                "[{round}/{count}] -> {payload}  <- {}",
                String::from_utf8_lossy(&bytes).trim_end()
            ),
            Notice::Failed(error) => bail!("exchange {round} failed: {error}"),
            _ => bail!("unexpected event during exchange {round}"),
        }
    }

    manager.disconnect(identity);
    loop {
        if let Notice::Disconnected = next_notice(&mut notices).await? {
            break;
        }
    }
    manager.shutdown();
    Ok(())
}

async fn next_notice(notices: &mut mpsc::UnboundedReceiver<Notice>) -> Result<Notice> {
    tokio::time::timeout(Duration::from_secs(10), notices.recv())
        .await
        .context("timed out waiting for the simulated peripheral")?
        .context("session controller stopped")
}
