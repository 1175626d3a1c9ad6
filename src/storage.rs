use anyhow::Result;
use image::ImageFormat;
use log::{Level, debug, error, log, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{DiskTierBounds, constants, validate_device_id};
use crate::error::StorageError;
use crate::frame::Frame;

/// Banded classification of filesystem fullness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskUsageTier {
    /// Below the warn boundary.
    Normal,
    /// Between warn and critical. Writes proceed with a warning.
    Warn,
    /// Between critical and full. Writes proceed with an error log.
    Critical,
    /// At or above the full boundary. Writes are refused.
    Full,
}

impl DiskUsageTier {
    /// Classify a usage percentage against the configured boundaries.
    pub fn classify(percent: f64, bounds: &DiskTierBounds) -> Self {
        if percent >= bounds.full {
            DiskUsageTier::Full
        } else if percent >= bounds.critical {
            DiskUsageTier::Critical
        } else if percent >= bounds.warn {
            DiskUsageTier::Warn
        } else {
            DiskUsageTier::Normal
        }
    }

    /// Severity a write at this tier is logged with. `None` for normal usage.
    pub fn log_level(self) -> Option<Level> {
        match self {
            DiskUsageTier::Normal => None,
            DiskUsageTier::Warn => Some(Level::Warn),
            DiskUsageTier::Critical | DiskUsageTier::Full => Some(Level::Error),
        }
    }
}

/// Source of filesystem usage figures.
pub trait DiskUsageProbe {
    /// Percentage (0 to 100) of the filesystem holding `path` that is in use.
    fn usage_percent(&self, path: &Path) -> Result<f64>;
}

/// Reads usage with `statvfs`, computed the way `df` does:
/// `used / (used + available to unprivileged users)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl DiskUsageProbe for StatvfsProbe {
    #[cfg(unix)]
    fn usage_percent(&self, path: &Path) -> Result<f64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid path: {}", e))?;
        // SAFETY: `c_path` is NUL-terminated and `stat` is a plain C struct
        // fully written by statvfs on success.
        let stat = unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                anyhow::bail!("statvfs failed: {}", std::io::Error::last_os_error());
            }
            stat
        };

        #[allow(clippy::unnecessary_cast)]
        let (blocks, free, available) = (
            stat.f_blocks as u64,
            stat.f_bfree as u64,
            stat.f_bavail as u64,
        );
        let used = blocks.saturating_sub(free);
        let usable = used + available;
        if usable == 0 {
            return Ok(0.0);
        }
        Ok(used as f64 * 100.0 / usable as f64)
    }

    #[cfg(not(unix))]
    fn usage_percent(&self, _path: &Path) -> Result<f64> {
        anyhow::bail!("Disk usage not supported on this platform")
    }
}

/// Local archive of frames, used when the collector is unreachable.
///
/// Frames land in `<root>/<device_id>/<YYYYMMDD>/<timestamp_label>.jpg`.
/// Every write first checks filesystem usage; a full disk refuses the write
/// and reports [`StorageError::DiskFull`], which the supervisor treats as
/// fatal rather than silently losing frames.
pub struct LocalStorageSink<P = StatvfsProbe> {
    device_dir: PathBuf,
    bounds: DiskTierBounds,
    probe: P,
}

impl<P: DiskUsageProbe> LocalStorageSink<P> {
    /// Create the sink and its device directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidDeviceId`] if `device_id` is not a
    /// plain directory name, and an error if the device directory cannot be
    /// created.
    pub fn new(
        root: impl AsRef<Path>,
        device_id: &str,
        bounds: DiskTierBounds,
        probe: P,
    ) -> Result<Self, StorageError> {
        validate_device_id("device_id", device_id).map_err(|e| {
            StorageError::InvalidDeviceId {
                device_id: device_id.to_string(),
                reason: e.to_string(),
            }
        })?;
        let device_dir = root.as_ref().join(device_id);
        fs::create_dir_all(&device_dir).map_err(|e| StorageError::WriteFailed {
            path: device_dir.display().to_string(),
            reason: e.to_string(),
        })?;

        match probe.usage_percent(&device_dir) {
            Ok(percent) if percent >= bounds.warn => {
                error!("file system almost full: {:.1}% used", percent);
            }
            Ok(percent) => debug!("Local storage at {:.1}% usage", percent),
            Err(e) => warn!("Could not read disk usage at startup: {}", e),
        }

        Ok(Self {
            device_dir,
            bounds,
            probe,
        })
    }

    /// Directory holding this device's archive.
    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    /// Path a frame with this capture date and label is written to.
    pub fn path_for(&self, frame: &Frame, timestamp_label: &str) -> PathBuf {
        self.device_dir
            .join(frame.captured_at.format("%Y%m%d").to_string())
            .join(format!("{}.{}", timestamp_label, constants::IMAGE_EXTENSION))
    }

    /// Store one frame as JPEG.
    ///
    /// Returns the written path. The write is a direct encode into the final
    /// file; a crash mid-write may leave a partial image behind.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DiskFull`] without writing when usage is at
    /// or above the full boundary, and [`StorageError::WriteFailed`] when
    /// the directory or file cannot be written.
    pub fn write(&self, frame: &Frame, timestamp_label: &str) -> Result<PathBuf, StorageError> {
        match self.probe.usage_percent(&self.device_dir) {
            Ok(percent) => {
                let tier = DiskUsageTier::classify(percent, &self.bounds);
                if tier == DiskUsageTier::Full {
                    error!(
                        "file system full: {:.1}% used, refusing to write {}",
                        percent, timestamp_label
                    );
                    return Err(StorageError::DiskFull {
                        path: self.device_dir.display().to_string(),
                        percent,
                    });
                }
                if let Some(level) = tier.log_level() {
                    log!(level, "file system almost full: {:.1}% used", percent);
                }
            }
            Err(e) => warn!("Could not read disk usage, writing anyway: {}", e),
        }

        let path = self.path_for(frame, timestamp_label);
        if let Some(day_dir) = path.parent() {
            fs::create_dir_all(day_dir).map_err(|e| StorageError::WriteFailed {
                path: day_dir.display().to_string(),
                reason: e.to_string(),
            })?;
        }

        frame
            .image
            .save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|e| StorageError::WriteFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        debug!("Stored frame at {}", path.display());
        Ok(path)
    }
}
