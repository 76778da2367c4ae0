//! g4linkd: listens to a Dexcom G4 Share receiver and logs its readings
//!
//! The receiver must already be paired and connected to this host (the
//! daemon never scans). Pass `--address` to skip locating it among the
//! connected devices.

use chrono::{DateTime, Utc};
use clap::Parser;
use g4link::{
    event_channel, services, BluezTransport, ConnectionConfig, ConnectionManager, ConnectionState,
    DeviceHandle, G4Error, GlucoseMonitor, GlucoseSample, Receiver, ReceiverConfig, SampleSink,
};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "g4linkd")]
#[command(about = "Listen to a Dexcom G4 Share receiver and log its glucose history")]
struct Args {
    /// Bluetooth address of a receiver known to be connected (format: AA:BB:CC:DD:EE:FF)
    #[arg(long, value_name = "MAC_ADDRESS")]
    address: Option<String>,

    /// Bluetooth adapter to use (default adapter if omitted)
    #[arg(long)]
    adapter: Option<String>,

    /// Locate attempts after the first before giving up
    #[arg(long, default_value = "6")]
    locate_retries: u32,

    /// Seconds between locate attempts
    #[arg(long, default_value = "10")]
    locate_backoff_secs: u64,

    /// Seconds to wait before reconnecting after a drop (0 = immediately)
    #[arg(long, default_value = "2")]
    reconnect_delay_secs: u64,

    /// Also subscribe to the receiver's heartbeat characteristic
    #[arg(long)]
    heartbeat: bool,
}

/// Logs new samples and remembers the newest one logged
#[derive(Default)]
struct LogSink {
    newest: Option<DateTime<Utc>>,
}

impl SampleSink for LogSink {
    fn add_samples(&mut self, samples: Vec<GlucoseSample>) {
        for sample in &samples {
            info!(
                "{} {} mg/dL {}{}",
                sample.date.format("%Y-%m-%d %H:%M:%S"),
                sample.glucose,
                sample.trend.map(|t| t.to_string()).unwrap_or_default(),
                if sample.is_display_only { " (display only)" } else { "" }
            );
        }
        if let Some(newest) = samples.iter().map(|s| s.date).max() {
            self.newest = Some(self.newest.map_or(newest, |n| n.max(newest)));
        }
    }

    fn include_after(&self) -> Option<DateTime<Utc>> {
        self.newest
    }

    fn on_error(&mut self, error: &G4Error) {
        error!("{}: {}", error.kind(), error);
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let session = bluer::Session::new().await?;
    let adapter = match &args.adapter {
        Some(name) => session.adapter(name)?,
        None => session.default_adapter().await?,
    };

    let config = ConnectionConfig {
        heartbeat_characteristic: args
            .heartbeat
            .then_some(services::HEARTBEAT_CHARACTERISTIC),
        locate_retries: args.locate_retries,
        locate_backoff: Duration::from_secs(args.locate_backoff_secs),
        reconnect_delay: Duration::from_secs(args.reconnect_delay_secs),
        ..ConnectionConfig::default()
    };

    let (events, event_receiver) = event_channel();
    let transport = Arc::new(BluezTransport::new(adapter, events.clone()).await?);
    info!("Using adapter {}", transport.adapter_name());

    let receiver = Receiver::new(
        ReceiverConfig::default(),
        GlucoseMonitor::new(LogSink::default()),
    );
    let mut manager = ConnectionManager::new(config, transport, receiver, events, event_receiver);

    if let Some(address) = args.address {
        address
            .parse::<bluer::Address>()
            .map_err(|_| G4Error::InvalidAddress(address.clone()))?;
        info!("Connecting directly to {}", address);
        manager = manager.with_device(DeviceHandle::new(address));
    }

    let (handle, task) = manager.spawn();
    let mut state = handle.watch();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow();
                info!("Link: {}", current);
                if current == ConnectionState::NotFound {
                    warn!("Receiver not found; make sure it is paired and connected");
                }
            }
        }
    }

    if let Err(e) = handle.shutdown() {
        debug!("Link already stopped: {}", e);
    }
    let receiver = task.await?;
    if let Some(latest) = receiver.delegate().latest_reading() {
        info!("Last reading: {}", latest);
    }

    Ok(())
}
