use anyhow::{Context, Result};
use log::{error, info};
use std::{panic, process, thread};

use motion_relay::error::panic_report;
use motion_relay::{
    ClientConfig, Config, ControlListener, DeliveryRouter, LocalStorageSink, MotionDetector,
    Pipeline, RelayError, ReliableNetworkClient, SharedModes, SnapshotSource, StatvfsProbe,
    TcpConnector,
};

/// Motion Relay - motion detection and reliable frame delivery for edge cameras.
///
/// Polls a camera, detects motion against a running background model and
/// forwards frames to a remote collector. When the collector stops
/// acknowledging, frames are archived locally until an operator command
/// arrives on the control channel.
///
/// # Environment Variables
///
/// Required:
/// * `IMAGE_URL` - Camera snapshot URL
///
/// Optional (with defaults):
/// * `DEVICE_ID` - Device tag and storage folder (default: "1")
/// * `COLLECTOR_HOST` / `COLLECTOR_PORT` - Remote collector (default: 192.168.1.36:5555)
/// * `CONTROL_BIND_HOST` / `CONTROL_PORT` - Control listener (default: 0.0.0.0:5556)
/// * `STORAGE_ROOT` - Local archive root (default: ".")
/// * `MIN_AREA` - Minimum motion region in pixels (default: 5000)
/// * `FLIP_IMAGE` - Flip images vertically (default: "false")
///
/// # Exit Status
///
/// * `1` - configuration error, camera failure, panic
/// * `2` - local storage is full
///
/// # Usage
///
/// ```bash
/// export IMAGE_URL="http://camera.local/snapshot.jpg"
/// export COLLECTOR_HOST="192.168.1.36"
/// export DEVICE_ID="porch"
/// ./motion-relay
/// ```
fn main() {
    // Initialize logger to output to stdout, using RUST_LOG env var or info level by default
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    // A panic on any thread, the control listener included, stops the device.
    panic::set_hook(Box::new(|info| {
        error!("{}", panic_report(thread::current().name(), info));
        process::exit(1);
    }));

    if let Err(e) = run() {
        let code = e
            .downcast_ref::<RelayError>()
            .map_or(1, RelayError::exit_code);
        error!("Motion relay stopped: {:#}", e);
        process::exit(code);
    }
}

fn run() -> Result<()> {
    let config = Config::load().context(
        "Failed to load configuration. Please ensure all required environment variables are set.",
    )?;

    info!("Starting Motion Relay for device {}", config.device_id);
    info!("Camera: {}", config.image_url);
    info!("Collector: tcp://{}", config.collector_addr);
    info!("Control channel: tcp://{}", config.control_addr);
    info!(
        "Initial modes: sending {}, capture {}",
        config.initial_modes.sending, config.initial_modes.capture
    );

    let modes = SharedModes::new(config.initial_modes);

    let sink = LocalStorageSink::new(
        &config.storage_root,
        &config.device_id,
        config.disk_tiers,
        StatvfsProbe,
    )?;
    info!("Local archive: {}", sink.device_dir().display());

    let client = ReliableNetworkClient::new(
        TcpConnector::new(config.collector_addr, config.request_timeout),
        ClientConfig::from_config(&config),
    );
    let router = DeliveryRouter::new(modes.clone(), client, sink, config.device_id.clone());

    ControlListener::bind(config.control_addr, modes)?
        .spawn()
        .context("Failed to start control listener")?;

    let detector = MotionDetector::new(config.motion.clone())?;
    let source = SnapshotSource::from_config(&config)?;

    info!("Warming up camera for {:?}", config.camera_warmup);
    thread::sleep(config.camera_warmup);

    Pipeline::new(source, detector, router).run()
}
