use chrono::{Local, TimeZone};
use image::{Rgb, RgbImage};
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

use motion_relay::config::DiskTierBounds;
use motion_relay::error::StorageError;
use motion_relay::storage::DiskUsageProbe;
use motion_relay::{
    CaptureMode, ClientConfig, ControlListener, DeliveryMode, DeliveryRouter, Frame,
    FrameCollector, LocalStorageSink, Modes, MotionVerdict, ReliableNetworkClient, RouteOutcome,
    SharedModes, TcpConnector, send_control_command,
};

struct QuietDisk;

struct FullDisk;

impl DiskUsageProbe for FullDisk {
    fn usage_percent(&self, _path: &Path) -> anyhow::Result<f64> {
        Ok(99.0)
    }
}

impl DiskUsageProbe for QuietDisk {
    fn usage_percent(&self, _path: &Path) -> anyhow::Result<f64> {
        Ok(20.0)
    }
}

fn sample_frame() -> Frame {
    let image = RgbImage::from_fn(16, 12, |x, y| Rgb([x as u8 * 10, y as u8 * 10, 128]));
    let captured_at = Local.with_ymd_and_hms(2026, 10, 19, 11, 22, 33).unwrap();
    Frame::new(image, captured_at)
}

fn client(addr: SocketAddr) -> ReliableNetworkClient {
    let timeout = Duration::from_millis(300);
    ReliableNetworkClient::new(
        TcpConnector::new(addr, timeout),
        ClientConfig {
            request_timeout: timeout,
            ..ClientConfig::default()
        },
    )
}

/// Start a collector that forwards every received frame to a channel.
fn spawn_collector() -> (SocketAddr, mpsc::Receiver<(String, Frame)>) {
    let collector = FrameCollector::bind("127.0.0.1:0".parse().unwrap()).expect("Bind failed");
    let addr = collector.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        collector.serve(move |tag, frame| {
            tx.send((tag.to_string(), frame))
                .map_err(|_| "test receiver gone".to_string())
        })
    });
    (addr, rx)
}

/// An address with nothing listening on it.
fn closed_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

#[test]
fn test_client_delivers_frames_to_collector() {
    let (addr, received) = spawn_collector();
    let mut client = client(addr);
    let frame = sample_frame();

    assert!(client.send(b"porch", &frame));
    assert!(!client.is_dropped());

    let (tag, delivered) = received
        .recv_timeout(Duration::from_secs(2))
        .expect("Collector received nothing");
    assert_eq!(tag, "porch");
    assert_eq!(delivered, frame);

    // The connection is reused for the next frame.
    assert!(client.send(b"porch", &frame));
    assert!(received.recv_timeout(Duration::from_secs(2)).is_ok());
}

#[test]
fn test_collector_serves_devices_concurrently() {
    let (addr, received) = spawn_collector();
    let mut first = client(addr);
    let mut second = client(addr);

    // The first device keeps its connection open while the second sends.
    assert!(first.send(b"porch", &sample_frame()));
    assert!(second.send(b"garage", &sample_frame()));
    assert!(first.send(b"porch", &sample_frame()));
    assert!(!second.is_dropped());

    let mut tags: Vec<String> = (0..3)
        .map(|_| {
            received
                .recv_timeout(Duration::from_secs(2))
                .expect("Collector received nothing")
                .0
        })
        .collect();
    tags.sort();
    assert_eq!(tags, vec!["garage", "porch", "porch"]);
}

#[test]
fn test_collector_storage_failure_is_not_acknowledged() {
    let dir = TempDir::new().unwrap();
    let collector = FrameCollector::bind("127.0.0.1:0".parse().unwrap()).expect("Bind failed");
    let addr = collector.local_addr().unwrap();
    let root = dir.path().to_path_buf();
    thread::spawn(move || {
        collector.serve(move |tag, frame| -> Result<(), StorageError> {
            let sink = LocalStorageSink::new(&root, tag, DiskTierBounds::default(), FullDisk)?;
            sink.write(&frame, &frame.timestamp_label()).map(|_| ())
        })
    });

    let mut client = client(addr);
    assert!(!client.send(b"porch", &sample_frame()));
    assert!(client.is_dropped());
}

#[test]
fn test_client_gives_up_on_silent_collector() {
    // Accepts connections through the backlog but never answers.
    let silent = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut client = client(silent.local_addr().unwrap());

    assert!(!client.send(b"porch", &sample_frame()));
    assert!(client.is_dropped());
    assert_eq!(client.retry_state().attempts_remaining, 0);
}

#[test]
fn test_router_falls_back_when_collector_offline() {
    let dir = TempDir::new().unwrap();
    let modes = SharedModes::new(Modes {
        sending: DeliveryMode::Network,
        capture: CaptureMode::MotionOnly,
    });
    let sink = LocalStorageSink::new(dir.path(), "porch", DiskTierBounds::default(), QuietDisk)
        .expect("Sink creation failed");
    let mut router = DeliveryRouter::new(modes.clone(), client(closed_addr()), sink, "porch");

    let frame = sample_frame();
    let verdict = MotionVerdict {
        detected: true,
        timestamp_label: frame.timestamp_label(),
        annotated_frame: frame,
        regions: Vec::new(),
    };

    match router.route(&verdict).expect("Routing failed") {
        RouteOutcome::FellBack(path) => {
            assert_eq!(
                path,
                dir.path()
                    .join("porch")
                    .join("20261019")
                    .join(format!("{}.jpg", verdict.timestamp_label))
            );
            assert!(path.is_file());
        }
        other => panic!("Expected fallback, got {:?}", other),
    }
    assert_eq!(modes.snapshot().sending, DeliveryMode::Local);
    assert!(router.client().is_dropped());

    // Stays local: the dropped client is not touched again.
    assert!(matches!(
        router.route(&verdict).expect("Routing failed"),
        RouteOutcome::StoredLocally(_)
    ));
    assert!(router.client().is_dropped());
}

#[test]
fn test_control_command_is_observed_by_next_route() {
    let dir = TempDir::new().unwrap();
    let (collector_addr, received) = spawn_collector();

    let modes = SharedModes::new(Modes::default());
    let listener = ControlListener::bind("127.0.0.1:0".parse().unwrap(), modes.clone())
        .expect("Control bind failed");
    let control_addr = listener.local_addr().unwrap();
    listener.spawn().expect("Control thread failed");

    let sink = LocalStorageSink::new(dir.path(), "porch", DiskTierBounds::default(), QuietDisk)
        .expect("Sink creation failed");
    let mut router = DeliveryRouter::new(modes.clone(), client(collector_addr), sink, "porch");

    // No motion and motion-only capture: nothing is delivered.
    let quiet = MotionVerdict::quiet(&sample_frame());
    assert_eq!(router.route(&quiet).unwrap(), RouteOutcome::Skipped);

    let reply = send_control_command(
        control_addr,
        "capture_mode_set_to_all_frames",
        Duration::from_secs(2),
    )
    .expect("Control command failed");
    assert_eq!(reply, "ok");

    assert_eq!(router.route(&quiet).unwrap(), RouteOutcome::SentToNetwork);
    let (tag, _) = received
        .recv_timeout(Duration::from_secs(2))
        .expect("Collector received nothing");
    assert_eq!(tag, "porch");

    let reply = send_control_command(control_addr, "self_destruct", Duration::from_secs(2))
        .expect("Control command failed");
    assert_eq!(reply, "ok");
    assert_eq!(
        modes.snapshot(),
        Modes {
            sending: DeliveryMode::Network,
            capture: CaptureMode::AllFrames,
        }
    );
}
