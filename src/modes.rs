use log::info;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::constants;

/// Which sink receives forwarded frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Send frames to the remote collector.
    Network,
    /// Archive frames on the local filesystem.
    Local,
}

/// Which detector verdicts are forwarded to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Only frames with detected motion.
    MotionOnly,
    /// Every frame, motion or not.
    AllFrames,
    /// Nothing is forwarded.
    None,
}

/// A consistent snapshot of both runtime modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modes {
    pub sending: DeliveryMode,
    pub capture: CaptureMode,
}

impl Default for Modes {
    fn default() -> Self {
        Self {
            sending: DeliveryMode::Local,
            capture: CaptureMode::MotionOnly,
        }
    }
}

/// Operator command received on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Liveness probe sent by the collector.
    Test,
    /// Forward only frames with motion.
    CaptureMotionDetection,
    /// Forward every frame.
    CaptureAllFrames,
    /// Anything else. Accepted and acknowledged.
    Unknown(String),
}

impl ControlCommand {
    pub fn parse(command: &str) -> Self {
        match command {
            constants::COMMAND_TEST => ControlCommand::Test,
            constants::COMMAND_CAPTURE_MOTION => ControlCommand::CaptureMotionDetection,
            constants::COMMAND_CAPTURE_ALL => ControlCommand::CaptureAllFrames,
            other => ControlCommand::Unknown(other.to_string()),
        }
    }

    /// Wire representation of the command.
    pub fn as_str(&self) -> &str {
        match self {
            ControlCommand::Test => constants::COMMAND_TEST,
            ControlCommand::CaptureMotionDetection => constants::COMMAND_CAPTURE_MOTION,
            ControlCommand::CaptureAllFrames => constants::COMMAND_CAPTURE_ALL,
            ControlCommand::Unknown(other) => other,
        }
    }
}

/// Runtime modes shared between the pipeline and the control listener.
///
/// Every read returns a whole [`Modes`] snapshot taken under the lock, so the
/// pipeline never observes one field from before a command and the other from
/// after it.
#[derive(Debug, Clone, Default)]
pub struct SharedModes {
    inner: Arc<Mutex<Modes>>,
}

impl SharedModes {
    pub fn new(initial: Modes) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    /// Current modes.
    pub fn snapshot(&self) -> Modes {
        *self.lock()
    }

    pub fn set_sending(&self, sending: DeliveryMode) {
        self.lock().sending = sending;
    }

    pub fn set_capture(&self, capture: CaptureMode) {
        self.lock().capture = capture;
    }

    /// Apply an operator command and return the resulting modes.
    ///
    /// Any command, including the `test` probe and unrecognized ones, switches
    /// delivery back to the network: hearing from the collector side means it
    /// is reachable again.
    pub fn apply(&self, command: &ControlCommand) -> Modes {
        let mut modes = self.lock();
        let before = *modes;

        modes.sending = DeliveryMode::Network;
        match command {
            ControlCommand::CaptureMotionDetection => modes.capture = CaptureMode::MotionOnly,
            ControlCommand::CaptureAllFrames => modes.capture = CaptureMode::AllFrames,
            ControlCommand::Test | ControlCommand::Unknown(_) => {}
        }

        if *modes != before {
            info!(
                "Modes changed by '{}': sending {} -> {}, capture {} -> {}",
                command.as_str(),
                before.sending,
                modes.sending,
                before.capture,
                modes.capture
            );
        }
        *modes
    }

    // Modes is plain Copy data, a panic while holding the lock cannot leave it
    // half-written.
    fn lock(&self) -> MutexGuard<'_, Modes> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Network => write!(f, "network"),
            DeliveryMode::Local => write!(f, "local"),
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureMode::MotionOnly => write!(f, "motion"),
            CaptureMode::AllFrames => write!(f, "all"),
            CaptureMode::None => write!(f, "none"),
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "network" => Ok(DeliveryMode::Network),
            "local" => Ok(DeliveryMode::Local),
            _ => Err("must be 'network' or 'local'".to_string()),
        }
    }
}

impl FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "motion" => Ok(CaptureMode::MotionOnly),
            "all" => Ok(CaptureMode::AllFrames),
            "none" => Ok(CaptureMode::None),
            _ => Err("must be 'motion', 'all' or 'none'".to_string()),
        }
    }
}
