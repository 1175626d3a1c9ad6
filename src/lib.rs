//! Motion Relay - motion detection and reliable frame delivery for edge cameras.
//!
//! This library watches a camera for motion, and forwards the interesting
//! frames either to a remote collector or to a local archive when the
//! collector cannot be reached. Operators steer the device at runtime over
//! a small control channel.
//!
//! # Core Components
//!
//! * [`config`] - Configuration loaded from environment variables
//! * [`source`] - Camera snapshot polling with retry logic
//! * [`detector`] - Running-average background model and motion regions
//! * [`client`] - Bounded-retry request/reply delivery to the collector
//! * [`storage`] - Dated local archive gated by disk usage tiers
//! * [`router`] - Per-frame choice between network and local delivery
//! * [`control`] - Operator command listener and client
//! * [`collector`] - Receiving end of frame delivery
//! * [`error`] - Error types and exit codes
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use motion_relay::*;
//!
//! let config = Config::load()?;
//! let modes = SharedModes::new(config.initial_modes);
//!
//! let client = ReliableNetworkClient::new(
//!     TcpConnector::new(config.collector_addr, config.request_timeout),
//!     ClientConfig::from_config(&config),
//! );
//! let sink = LocalStorageSink::new(
//!     &config.storage_root,
//!     &config.device_id,
//!     config.disk_tiers,
//!     StatvfsProbe,
//! )?;
//! let router = DeliveryRouter::new(modes, client, sink, config.device_id.clone());
//!
//! let mut pipeline = Pipeline::new(
//!     SnapshotSource::from_config(&config)?,
//!     MotionDetector::new(config.motion.clone())?,
//!     router,
//! );
//! pipeline.run()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod client;
pub mod collector;
pub mod config;
pub mod control;
pub mod detector;
pub mod error;
pub mod frame;
pub mod modes;
pub mod pipeline;
pub mod router;
pub mod source;
pub mod storage;
pub mod wire;

// Re-export commonly used types for convenience
pub use client::{ClientConfig, ReliableNetworkClient, TcpConnector};
pub use collector::FrameCollector;
pub use config::Config;
pub use control::{ControlListener, send_control_command};
pub use detector::{MotionDetector, MotionVerdict};
pub use error::RelayError;
pub use frame::Frame;
pub use modes::{CaptureMode, DeliveryMode, Modes, SharedModes};
pub use pipeline::Pipeline;
pub use router::{DeliveryRouter, RouteOutcome};
pub use source::{FrameSource, SnapshotSource};
pub use storage::{LocalStorageSink, StatvfsProbe};
