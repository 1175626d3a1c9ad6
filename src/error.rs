use std::backtrace::Backtrace;
use std::fmt;

/// Error types for the motion relay.
///
/// Each concern of the device (configuration, frame encoding, detection,
/// delivery and local storage) has its own error enum, and all of them fold
/// into [`RelayError`] so the supervisor in `main` can decide how to stop.

/// Main error type for motion relay operations.
#[derive(Debug)]
pub enum RelayError {
    /// Configuration and setup errors.
    ConfigError(ConfigError),

    /// Frame encoding and decoding errors.
    FrameError(FrameError),

    /// Errors raised by the motion detector.
    DetectionError(DetectionError),

    /// Network and socket errors outside the retrying client.
    NetworkError(NetworkError),

    /// Local storage errors.
    StorageError(StorageError),
}

/// Errors related to configuration and application setup.
#[derive(Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    MissingEnvVar { var_name: String },

    /// Invalid configuration values provided.
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// Optional file referenced by the configuration could not be used.
    FileReadError { path: String, reason: String },
}

/// Errors raised while encoding or decoding a frame payload.
#[derive(Debug)]
pub enum FrameError {
    /// Payload is shorter than the fixed header.
    Truncated { expected: usize, actual: usize },

    /// Header dimensions do not match the pixel data length.
    SizeMismatch {
        width: u32,
        height: u32,
        pixel_bytes: usize,
    },

    /// Capture timestamp is outside the representable range.
    InvalidTimestamp { micros: i64 },
}

/// Errors raised by the motion detector.
#[derive(Debug)]
pub enum DetectionError {
    /// Frame dimensions differ from the background model.
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

/// Errors related to sockets owned outside the retrying client.
#[derive(Debug)]
pub enum NetworkError {
    /// A listener could not be bound.
    BindFailed { address: String, reason: String },

    /// A request could not be completed.
    RequestFailed { address: String, reason: String },
}

/// Errors raised by the local storage sink.
#[derive(Debug)]
pub enum StorageError {
    /// Filesystem usage reached the full tier. The write was refused.
    DiskFull { path: String, percent: f64 },

    /// A directory or image file could not be written.
    WriteFailed { path: String, reason: String },

    /// The device identifier cannot be used as an archive folder name.
    InvalidDeviceId { device_id: String, reason: String },
}

impl RelayError {
    /// Process exit status used by the supervisor for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::StorageError(StorageError::DiskFull { .. }) => 2,
            _ => 1,
        }
    }
}

/// Log line for a panic, with the stack of the panicking thread.
pub fn panic_report(thread_name: Option<&str>, message: &dyn fmt::Display) -> String {
    format!(
        "Panic in thread '{}': {}\nstack backtrace:\n{}",
        thread_name.unwrap_or("unnamed"),
        message,
        Backtrace::force_capture()
    )
}

impl StorageError {
    /// Whether this error must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::DiskFull { .. })
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::ConfigError(e) => write!(f, "Configuration error: {}", e),
            RelayError::FrameError(e) => write!(f, "Frame error: {}", e),
            RelayError::DetectionError(e) => write!(f, "Detection error: {}", e),
            RelayError::NetworkError(e) => write!(f, "Network error: {}", e),
            RelayError::StorageError(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingEnvVar { var_name } => {
                write!(f, "Required environment variable '{}' is not set", var_name)
            }
            ConfigError::InvalidValue {
                field,
                value,
                reason,
            } => {
                write!(
                    f,
                    "Invalid value '{}' for field '{}': {}",
                    value, field, reason
                )
            }
            ConfigError::FileReadError { path, reason } => {
                write!(f, "Failed to read '{}': {}", path, reason)
            }
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated { expected, actual } => {
                write!(
                    f,
                    "Frame payload too short: expected at least {} bytes, got {}",
                    expected, actual
                )
            }
            FrameError::SizeMismatch {
                width,
                height,
                pixel_bytes,
            } => {
                write!(
                    f,
                    "Frame header says {}x{} but carries {} pixel bytes",
                    width, height, pixel_bytes
                )
            }
            FrameError::InvalidTimestamp { micros } => {
                write!(f, "Capture timestamp {} is out of range", micros)
            }
        }
    }
}

impl fmt::Display for DetectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionError::DimensionMismatch { expected, actual } => {
                write!(
                    f,
                    "Frame is {}x{} but the background model is {}x{}",
                    actual.0, actual.1, expected.0, expected.1
                )
            }
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::BindFailed { address, reason } => {
                write!(f, "Failed to bind '{}': {}", address, reason)
            }
            NetworkError::RequestFailed { address, reason } => {
                write!(f, "Request to '{}' failed: {}", address, reason)
            }
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::DiskFull { path, percent } => {
                write!(
                    f,
                    "File system holding '{}' is full ({:.1}% used), refusing to write",
                    path, percent
                )
            }
            StorageError::WriteFailed { path, reason } => {
                write!(f, "Failed to write '{}': {}", path, reason)
            }
            StorageError::InvalidDeviceId { device_id, reason } => {
                write!(f, "Invalid device identifier {:?}: {}", device_id, reason)
            }
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::ConfigError(e) => Some(e),
            RelayError::FrameError(e) => Some(e),
            RelayError::DetectionError(e) => Some(e),
            RelayError::NetworkError(e) => Some(e),
            RelayError::StorageError(e) => Some(e),
        }
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for FrameError {}
impl std::error::Error for DetectionError {}
impl std::error::Error for NetworkError {}
impl std::error::Error for StorageError {}

impl From<ConfigError> for RelayError {
    fn from(err: ConfigError) -> Self {
        RelayError::ConfigError(err)
    }
}

impl From<FrameError> for RelayError {
    fn from(err: FrameError) -> Self {
        RelayError::FrameError(err)
    }
}

impl From<DetectionError> for RelayError {
    fn from(err: DetectionError) -> Self {
        RelayError::DetectionError(err)
    }
}

impl From<NetworkError> for RelayError {
    fn from(err: NetworkError) -> Self {
        RelayError::NetworkError(err)
    }
}

impl From<StorageError> for RelayError {
    fn from(err: StorageError) -> Self {
        RelayError::StorageError(err)
    }
}
