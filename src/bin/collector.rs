use anyhow::Result;
use log::{error, info};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::process;
use std::sync::{Mutex, PoisonError};

use motion_relay::config::{DiskTierBounds, constants, env_socket_addr};
use motion_relay::error::StorageError;
use motion_relay::{FrameCollector, LocalStorageSink, StatvfsProbe};

/// Receives frames from motion relay devices and archives them.
///
/// Frames land in `<COLLECTOR_STORAGE_ROOT>/<device>/<YYYYMMDD>/<timestamp>.jpg`,
/// the same layout devices use for their own fallback archive. A frame that
/// cannot be stored is answered with an error so the device keeps it.
///
/// # Environment Variables
///
/// * `COLLECTOR_BIND_HOST` - Address to listen on (default: "0.0.0.0")
/// * `COLLECTOR_PORT` - Port to listen on (default: 5555)
/// * `COLLECTOR_STORAGE_ROOT` - Archive root (default: "./received")
fn main() {
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    if let Err(e) = run() {
        error!("Collector stopped: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let addr = env_socket_addr(
        ("COLLECTOR_BIND_HOST", "0.0.0.0"),
        ("COLLECTOR_PORT", constants::DEFAULT_COLLECTOR_PORT),
    )?;
    let root = PathBuf::from(
        std::env::var("COLLECTOR_STORAGE_ROOT").unwrap_or_else(|_| "./received".to_string()),
    );

    let collector = FrameCollector::bind(addr)?;
    info!("Archiving received frames under {}", root.display());

    // Devices are served concurrently, one sink per device.
    let sinks: Mutex<HashMap<String, LocalStorageSink>> = Mutex::new(HashMap::new());
    collector.serve(move |device, frame| -> Result<(), StorageError> {
        let mut sinks = sinks.lock().unwrap_or_else(PoisonError::into_inner);
        let sink = match sinks.entry(device.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(LocalStorageSink::new(
                &root,
                device,
                DiskTierBounds::default(),
                StatvfsProbe,
            )?),
        };

        match sink.write(&frame, &frame.timestamp_label()) {
            Ok(path) => {
                info!("Stored frame from device {} at {}", device, path.display());
                Ok(())
            }
            Err(e) => {
                error!("Dropped frame from device {}: {}", device, e);
                Err(e)
            }
        }
    });

    anyhow::bail!("Collector stopped accepting connections")
}
