use anyhow::{Context, Result};
use log::debug;

use crate::client::Connector;
use crate::detector::MotionDetector;
use crate::router::{DeliveryRouter, RouteOutcome};
use crate::source::FrameSource;
use crate::storage::DiskUsageProbe;

/// Capture, detect and route, one frame at a time.
///
/// Detection runs on every frame whatever the capture mode, so the
/// background model is current when the operator switches modes. A slow
/// network send delays the next capture; nothing is queued.
pub struct Pipeline<S, C: Connector, P> {
    source: S,
    detector: MotionDetector,
    router: DeliveryRouter<C, P>,
}

impl<S, C, P> Pipeline<S, C, P>
where
    S: FrameSource,
    C: Connector,
    P: DiskUsageProbe,
{
    pub fn new(source: S, detector: MotionDetector, router: DeliveryRouter<C, P>) -> Self {
        Self {
            source,
            detector,
            router,
        }
    }

    pub fn router(&self) -> &DeliveryRouter<C, P> {
        &self.router
    }

    /// Process one frame.
    pub fn tick(&mut self) -> Result<RouteOutcome> {
        let frame = self.source.next_frame().context("Frame capture failed")?;
        let verdict = self.detector.detect(&frame)?;
        let outcome = self.router.route(&verdict)?;
        debug!("{} -> {:?}", verdict.timestamp_label, outcome);
        Ok(outcome)
    }

    /// Process frames until an error stops the pipeline.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.tick()?;
        }
    }
}
