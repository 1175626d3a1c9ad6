use anyhow::{Context, Result};
use log::error;
use std::process;
use std::time::Duration;

use motion_relay::config::{constants, env_socket_addr};
use motion_relay::send_control_command;

/// Sends one operator command to a motion relay device.
///
/// # Usage
///
/// ```bash
/// export CONTROL_HOST="192.168.1.50"
/// relayctl capture_mode_set_to_all_frames
/// ```
///
/// Known commands: `test`, `capture_mode_set_to_motion_detection`,
/// `capture_mode_set_to_all_frames`. Any command switches the device back
/// to network delivery.
fn main() {
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stderr)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Warn),
        )
        .init();

    match run() {
        Ok(reply) => println!("{}", reply),
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}

fn run() -> Result<String> {
    let command = std::env::args().nth(1).with_context(|| {
        format!(
            "usage: relayctl <{}|{}|{}>",
            constants::COMMAND_TEST,
            constants::COMMAND_CAPTURE_MOTION,
            constants::COMMAND_CAPTURE_ALL
        )
    })?;

    let addr = env_socket_addr(
        ("CONTROL_HOST", "127.0.0.1"),
        ("CONTROL_PORT", constants::DEFAULT_CONTROL_PORT),
    )?;
    let timeout = Duration::from_millis(constants::DEFAULT_REQUEST_TIMEOUT_MS);

    send_control_command(addr, &command, timeout)
        .with_context(|| format!("No reply from device at {}", addr))
}
