use log::{debug, error, warn};
use std::path::PathBuf;

use crate::client::{Connector, ReliableNetworkClient, TcpConnector};
use crate::detector::MotionVerdict;
use crate::error::RelayError;
use crate::modes::{CaptureMode, DeliveryMode, SharedModes};
use crate::storage::{DiskUsageProbe, LocalStorageSink, StatvfsProbe};

/// What happened to one verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The capture mode filtered the frame out.
    Skipped,
    /// The collector acknowledged the frame.
    SentToNetwork,
    /// Delivery mode was local; the frame was archived.
    StoredLocally(PathBuf),
    /// Network delivery failed; the frame was archived and delivery switched to local.
    FellBack(PathBuf),
    /// The frame could not be delivered anywhere.
    Lost,
}

/// Routes detector verdicts to the collector or the local archive
/// according to the shared runtime modes.
pub struct DeliveryRouter<C: Connector = TcpConnector, P = StatvfsProbe> {
    modes: SharedModes,
    client: ReliableNetworkClient<C>,
    local: LocalStorageSink<P>,
    tag: String,
}

impl<C: Connector, P: DiskUsageProbe> DeliveryRouter<C, P> {
    pub fn new(
        modes: SharedModes,
        client: ReliableNetworkClient<C>,
        local: LocalStorageSink<P>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            modes,
            client,
            local,
            tag: tag.into(),
        }
    }

    pub fn modes(&self) -> &SharedModes {
        &self.modes
    }

    pub fn client(&self) -> &ReliableNetworkClient<C> {
        &self.client
    }

    pub fn local(&self) -> &LocalStorageSink<P> {
        &self.local
    }

    /// Deliver one verdict.
    ///
    /// # Errors
    ///
    /// Only a full disk is returned as an error. Every other failure is
    /// logged and reported through the outcome.
    pub fn route(&mut self, verdict: &MotionVerdict) -> Result<RouteOutcome, RelayError> {
        let modes = self.modes.snapshot();

        match modes.capture {
            CaptureMode::None => return Ok(RouteOutcome::Skipped),
            CaptureMode::MotionOnly if !verdict.detected => return Ok(RouteOutcome::Skipped),
            CaptureMode::MotionOnly | CaptureMode::AllFrames => {}
        }

        match modes.sending {
            DeliveryMode::Network => {
                if self
                    .client
                    .send(self.tag.as_bytes(), &verdict.annotated_frame)
                {
                    debug!("Delivered {} to collector", verdict.timestamp_label);
                    return Ok(RouteOutcome::SentToNetwork);
                }

                warn!(
                    "Collector unreachable, switching to local storage from {}",
                    verdict.timestamp_label
                );
                self.modes.set_sending(DeliveryMode::Local);
                Ok(self.store(verdict)?.map_or(RouteOutcome::Lost, RouteOutcome::FellBack))
            }
            DeliveryMode::Local => Ok(self
                .store(verdict)?
                .map_or(RouteOutcome::Lost, RouteOutcome::StoredLocally)),
        }
    }

    /// Write to the local sink. `Ok(None)` means a non-fatal write failure.
    fn store(&self, verdict: &MotionVerdict) -> Result<Option<PathBuf>, RelayError> {
        match self
            .local
            .write(&verdict.annotated_frame, &verdict.timestamp_label)
        {
            Ok(path) => Ok(Some(path)),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                error!("Lost frame {}: {}", verdict.timestamp_label, e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, Connection};
    use crate::config::DiskTierBounds;
    use crate::error::StorageError;
    use crate::modes::Modes;
    use chrono::{Local, TimeZone};
    use image::RgbImage;
    use std::cell::Cell;
    use std::io;
    use std::path::Path;
    use std::rc::Rc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Connector that either acknowledges everything or refuses every connect.
    #[derive(Clone)]
    struct FakeCollector {
        online: bool,
        connects: Rc<Cell<usize>>,
    }

    struct AlwaysAck;

    impl Connection for AlwaysAck {
        fn send_parts(&mut self, _parts: &[&[u8]]) -> io::Result<()> {
            Ok(())
        }

        fn recv_reply(&mut self, _timeout: Duration) -> io::Result<Option<Vec<u8>>> {
            Ok(Some(b"ack".to_vec()))
        }
    }

    impl Connector for FakeCollector {
        type Conn = AlwaysAck;

        fn connect(&self) -> io::Result<AlwaysAck> {
            self.connects.set(self.connects.get() + 1);
            if self.online {
                Ok(AlwaysAck)
            } else {
                Err(io::ErrorKind::ConnectionRefused.into())
            }
        }

        fn endpoint(&self) -> String {
            "fake".to_string()
        }
    }

    struct FixedUsage(f64);

    impl DiskUsageProbe for FixedUsage {
        fn usage_percent(&self, _path: &Path) -> anyhow::Result<f64> {
            Ok(self.0)
        }
    }

    fn router(
        dir: &TempDir,
        online: bool,
        usage: f64,
        modes: Modes,
    ) -> (DeliveryRouter<FakeCollector, FixedUsage>, Rc<Cell<usize>>) {
        let connects = Rc::new(Cell::new(0));
        let connector = FakeCollector {
            online,
            connects: connects.clone(),
        };
        let client = ReliableNetworkClient::new(connector, ClientConfig::default());
        let sink =
            LocalStorageSink::new(dir.path(), "7", DiskTierBounds::default(), FixedUsage(usage))
                .unwrap();
        (
            DeliveryRouter::new(SharedModes::new(modes), client, sink, "7"),
            connects,
        )
    }

    fn verdict(detected: bool, second: u32) -> MotionVerdict {
        let captured_at = Local.with_ymd_and_hms(2026, 10, 19, 9, 0, second).unwrap();
        let frame = crate::frame::Frame::new(RgbImage::new(4, 4), captured_at);
        MotionVerdict {
            detected,
            timestamp_label: frame.timestamp_label(),
            annotated_frame: frame,
            regions: Vec::new(),
        }
    }

    fn network(capture: CaptureMode) -> Modes {
        Modes {
            sending: DeliveryMode::Network,
            capture,
        }
    }

    #[test]
    fn capture_mode_filters_verdicts() {
        let dir = TempDir::new().unwrap();
        let (mut router, connects) = router(&dir, true, 10.0, network(CaptureMode::MotionOnly));

        assert_eq!(router.route(&verdict(false, 0)).unwrap(), RouteOutcome::Skipped);
        assert_eq!(
            router.route(&verdict(true, 1)).unwrap(),
            RouteOutcome::SentToNetwork
        );

        router.modes().set_capture(CaptureMode::None);
        assert_eq!(router.route(&verdict(true, 2)).unwrap(), RouteOutcome::Skipped);

        router.modes().set_capture(CaptureMode::AllFrames);
        assert_eq!(
            router.route(&verdict(false, 3)).unwrap(),
            RouteOutcome::SentToNetwork
        );
        assert_eq!(connects.get(), 1);
    }

    #[test]
    fn failed_send_falls_back_to_local_storage() {
        let dir = TempDir::new().unwrap();
        let (mut router, connects) = router(&dir, false, 10.0, network(CaptureMode::MotionOnly));

        let first = verdict(true, 0);
        let path = match router.route(&first).unwrap() {
            RouteOutcome::FellBack(path) => path,
            other => panic!("expected fallback, got {:?}", other),
        };
        assert!(path.is_file());
        assert!(path.ends_with(format!("20261019/{}.jpg", first.timestamp_label)));
        assert_eq!(router.modes().snapshot().sending, DeliveryMode::Local);
        assert_eq!(connects.get(), 3);

        // Local mode sticks until the control channel resets it.
        match router.route(&verdict(true, 1)).unwrap() {
            RouteOutcome::StoredLocally(path) => assert!(path.is_file()),
            other => panic!("expected local storage, got {:?}", other),
        }
        assert_eq!(connects.get(), 3);
    }

    #[test]
    fn full_disk_is_the_only_error() {
        let dir = TempDir::new().unwrap();
        let (mut router, _) = router(&dir, false, 97.0, Modes::default());

        match router.route(&verdict(true, 0)) {
            Err(RelayError::StorageError(StorageError::DiskFull { percent, .. })) => {
                assert_eq!(percent, 97.0)
            }
            other => panic!("expected DiskFull, got {:?}", other),
        }
    }
}
