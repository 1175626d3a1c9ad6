use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::modes::{CaptureMode, DeliveryMode, Modes};

/// Configuration for the motion relay loaded from environment variables.
///
/// Every tunable of the device is externalized here. Values are validated
/// when loaded, so a bad address or port stops the process before the
/// camera, the listener or any socket is touched.
#[derive(Debug, Clone)]
pub struct Config {
    /// Camera still-image URL polled for frames.
    /// Environment variable: `IMAGE_URL`
    pub image_url: String,

    /// Frame width in pixels. Environment variable: `FRAME_WIDTH`
    pub frame_width: u32,

    /// Frame height in pixels. Environment variable: `FRAME_HEIGHT`
    pub frame_height: u32,

    /// Frames captured per second. Environment variable: `FRAME_RATE`
    pub frame_rate: u32,

    /// Delay before the first capture. Environment variable: `CAMERA_WARMUP_MS`
    pub camera_warmup: Duration,

    /// Whether to flip captured images vertically.
    ///
    /// Useful for cameras mounted upside-down.
    /// Environment variable: `FLIP_IMAGE`
    pub flip_image: bool,

    /// Number of fetch attempts before the source gives up.
    /// Environment variable: `MAX_FETCH_RETRIES`
    pub max_fetch_retries: u32,

    /// Delay between fetch attempts. Environment variable: `FETCH_RETRY_DELAY_SECONDS`
    pub fetch_retry_delay: Duration,

    /// Motion detector tuning.
    pub motion: MotionConfig,

    /// Identifier of this device, used as the delivery tag and storage folder.
    /// Environment variable: `DEVICE_ID`
    pub device_id: String,

    /// Remote collector address.
    /// Environment variables: `COLLECTOR_HOST`, `COLLECTOR_PORT`
    pub collector_addr: SocketAddr,

    /// Address the control listener binds to.
    /// Environment variables: `CONTROL_BIND_HOST`, `CONTROL_PORT`
    pub control_addr: SocketAddr,

    /// Send attempts per frame. Environment variable: `MAX_RETRIES`
    pub max_retries: u32,

    /// How long to wait for each acknowledgement.
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    pub request_timeout: Duration,

    /// Root of the local archive. Environment variable: `STORAGE_ROOT`
    pub storage_root: PathBuf,

    /// Disk usage tier boundaries, in percent.
    /// Environment variables: `DISK_WARN_PERCENT`, `DISK_CRITICAL_PERCENT`, `DISK_FULL_PERCENT`
    pub disk_tiers: DiskTierBounds,

    /// Modes the device starts in.
    /// Environment variables: `INITIAL_SENDING_MODE`, `INITIAL_CAPTURE_MODE`
    pub initial_modes: Modes,
}

/// Motion detector parameters.
#[derive(Debug, Clone)]
pub struct MotionConfig {
    /// Smallest changed region, in pixels, that counts as motion.
    /// Environment variable: `MIN_AREA`
    pub min_area: u32,

    /// Per-pixel difference above which a pixel counts as changed.
    /// Environment variable: `DELTA_THRESHOLD`
    pub delta_threshold: u8,

    /// Weight of the newest frame in the running background average.
    /// Environment variable: `BLEND_WEIGHT`
    pub blend_weight: f32,

    /// Gaussian blur sigma applied to the grayscale frame, `0` disables it.
    /// Environment variable: `BLUR_SIGMA`
    pub blur_sigma: f32,

    /// Dilation radius used to merge nearby changed regions, `0` disables it.
    /// Environment variable: `DILATE_RADIUS`
    pub dilate_radius: u8,

    /// TrueType font used to stamp the capture time on annotated frames.
    /// Environment variable: `ANNOTATION_FONT`
    pub annotation_font: Option<PathBuf>,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            min_area: constants::DEFAULT_MIN_AREA,
            delta_threshold: constants::DEFAULT_DELTA_THRESHOLD,
            blend_weight: constants::DEFAULT_BLEND_WEIGHT,
            blur_sigma: constants::DEFAULT_BLUR_SIGMA,
            dilate_radius: constants::DEFAULT_DILATE_RADIUS,
            annotation_font: None,
        }
    }
}

/// Disk usage percentages at which the local sink escalates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskTierBounds {
    pub warn: f64,
    pub critical: f64,
    pub full: f64,
}

impl Default for DiskTierBounds {
    fn default() -> Self {
        Self {
            warn: constants::DEFAULT_DISK_WARN_PERCENT,
            critical: constants::DEFAULT_DISK_CRITICAL_PERCENT,
            full: constants::DEFAULT_DISK_FULL_PERCENT,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `IMAGE_URL` is not set, or if any variable cannot
    /// be parsed or fails validation (IP addresses, ports between 1000 and
    /// 49152, ascending disk tiers, at least one retry).
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// let config = motion_relay::Config::load().expect("Failed to load configuration");
    /// ```
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let image_url = vars.required("IMAGE_URL")?;
        let frame_width = vars.parse("FRAME_WIDTH", constants::DEFAULT_FRAME_WIDTH)?;
        let frame_height = vars.parse("FRAME_HEIGHT", constants::DEFAULT_FRAME_HEIGHT)?;
        let frame_rate = vars.parse("FRAME_RATE", constants::DEFAULT_FRAME_RATE)?;
        let camera_warmup = Duration::from_millis(
            vars.parse("CAMERA_WARMUP_MS", constants::DEFAULT_CAMERA_WARMUP_MS)?,
        );
        let flip_image = vars.parse("FLIP_IMAGE", false)?;
        let max_fetch_retries = vars.parse("MAX_FETCH_RETRIES", constants::MAX_FETCH_RETRIES)?;
        let fetch_retry_delay = Duration::from_secs(vars.parse(
            "FETCH_RETRY_DELAY_SECONDS",
            constants::FETCH_RETRY_DELAY_SECONDS,
        )?);

        let motion = MotionConfig {
            min_area: vars.parse("MIN_AREA", constants::DEFAULT_MIN_AREA)?,
            delta_threshold: vars.parse("DELTA_THRESHOLD", constants::DEFAULT_DELTA_THRESHOLD)?,
            blend_weight: vars.parse("BLEND_WEIGHT", constants::DEFAULT_BLEND_WEIGHT)?,
            blur_sigma: vars.parse("BLUR_SIGMA", constants::DEFAULT_BLUR_SIGMA)?,
            dilate_radius: vars.parse("DILATE_RADIUS", constants::DEFAULT_DILATE_RADIUS)?,
            annotation_font: vars.optional("ANNOTATION_FONT").map(PathBuf::from),
        };

        let device_id = vars
            .optional("DEVICE_ID")
            .unwrap_or_else(|| constants::DEFAULT_DEVICE_ID.to_string());

        let collector_addr = socket_addr(
            &vars,
            ("COLLECTOR_HOST", constants::DEFAULT_COLLECTOR_HOST),
            ("COLLECTOR_PORT", constants::DEFAULT_COLLECTOR_PORT),
        )?;
        let control_addr = socket_addr(
            &vars,
            ("CONTROL_BIND_HOST", constants::DEFAULT_CONTROL_BIND_HOST),
            ("CONTROL_PORT", constants::DEFAULT_CONTROL_PORT),
        )?;

        let max_retries = vars.parse("MAX_RETRIES", constants::DEFAULT_MAX_RETRIES)?;
        let request_timeout = Duration::from_millis(
            vars.parse("REQUEST_TIMEOUT_MS", constants::DEFAULT_REQUEST_TIMEOUT_MS)?,
        );

        let storage_root = PathBuf::from(
            vars.optional("STORAGE_ROOT")
                .unwrap_or_else(|| constants::DEFAULT_STORAGE_ROOT.to_string()),
        );

        let disk_tiers = DiskTierBounds {
            warn: vars.parse("DISK_WARN_PERCENT", constants::DEFAULT_DISK_WARN_PERCENT)?,
            critical: vars.parse(
                "DISK_CRITICAL_PERCENT",
                constants::DEFAULT_DISK_CRITICAL_PERCENT,
            )?,
            full: vars.parse("DISK_FULL_PERCENT", constants::DEFAULT_DISK_FULL_PERCENT)?,
        };

        let initial_modes = Modes {
            sending: vars.parse("INITIAL_SENDING_MODE", DeliveryMode::Local)?,
            capture: vars.parse("INITIAL_CAPTURE_MODE", CaptureMode::MotionOnly)?,
        };

        let config = Config {
            image_url,
            frame_width,
            frame_height,
            frame_rate,
            camera_warmup,
            flip_image,
            max_fetch_retries,
            fetch_retry_delay,
            motion,
            device_id,
            collector_addr,
            control_addr,
            max_retries,
            request_timeout,
            storage_root,
            disk_tiers,
            initial_modes,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that parsing alone cannot catch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(invalid(
                "FRAME_WIDTH/FRAME_HEIGHT",
                format!("{}x{}", self.frame_width, self.frame_height),
                "frame dimensions must be non-zero",
            ));
        }
        if self.frame_rate == 0 {
            return Err(invalid("FRAME_RATE", "0", "frame rate must be positive"));
        }
        if self.max_retries == 0 {
            return Err(invalid("MAX_RETRIES", "0", "at least one attempt is required"));
        }
        if self.request_timeout.is_zero() {
            return Err(invalid("REQUEST_TIMEOUT_MS", "0", "timeout must be positive"));
        }
        if self.max_fetch_retries == 0 {
            return Err(invalid(
                "MAX_FETCH_RETRIES",
                "0",
                "at least one attempt is required",
            ));
        }
        validate_device_id("DEVICE_ID", &self.device_id)?;

        let weight = self.motion.blend_weight;
        if !(weight > 0.0 && weight <= 1.0) {
            return Err(invalid(
                "BLEND_WEIGHT",
                weight.to_string(),
                "must be in (0, 1]",
            ));
        }
        if self.motion.blur_sigma < 0.0 || !self.motion.blur_sigma.is_finite() {
            return Err(invalid(
                "BLUR_SIGMA",
                self.motion.blur_sigma.to_string(),
                "must be zero or a positive number",
            ));
        }

        let tiers = self.disk_tiers;
        if !(tiers.warn < tiers.critical && tiers.critical < tiers.full && tiers.full <= 100.0)
            || tiers.warn <= 0.0
        {
            return Err(invalid(
                "DISK_*_PERCENT",
                format!("{}/{}/{}", tiers.warn, tiers.critical, tiers.full),
                "tiers must be strictly ascending within (0, 100]",
            ));
        }

        Ok(())
    }

    /// Delay between two captures at the configured frame rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frame_rate))
    }
}

/// Validate a port against the range the device accepts.
pub fn validate_port(field: &str, port: u16) -> Result<u16, ConfigError> {
    if (constants::MIN_PORT..=constants::MAX_PORT).contains(&port) {
        Ok(port)
    } else {
        Err(invalid(
            field,
            port.to_string(),
            &format!(
                "port value must be in {} to {} range",
                constants::MIN_PORT,
                constants::MAX_PORT
            ),
        ))
    }
}

/// Validate that a device identifier is a single plain directory name.
///
/// Device identifiers name the archive folder on both the device and the
/// collector, where they arrive from the network. Empty values, path
/// separators, `.`, `..` and absolute paths are refused.
pub fn validate_device_id(field: &str, device_id: &str) -> Result<(), ConfigError> {
    if device_id.trim().is_empty() {
        return Err(invalid(field, device_id, "must not be empty"));
    }
    let mut components = Path::new(device_id).components();
    let single_name = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single_name || device_id.contains(['/', '\\']) || device_id.contains('\0') {
        return Err(invalid(
            field,
            device_id,
            "must be usable as a directory name",
        ));
    }
    Ok(())
}

/// Validate that `host` is a literal IPv4 or IPv6 address.
pub fn validate_host(field: &str, host: &str) -> Result<IpAddr, ConfigError> {
    host.trim()
        .parse::<IpAddr>()
        .map_err(|_| invalid(field, host, "not a valid IP address"))
}

/// Read and validate a host/port pair from the environment.
///
/// Used by the companion binaries, which only need an address and not the
/// full device configuration.
pub fn env_socket_addr(
    host: (&str, &str),
    port: (&str, u16),
) -> Result<SocketAddr, ConfigError> {
    let lookup = |name: &str| std::env::var(name).ok();
    socket_addr(&Vars(&lookup), host, port)
}

fn socket_addr(
    vars: &Vars<'_>,
    (host_var, host_default): (&str, &str),
    (port_var, port_default): (&str, u16),
) -> Result<SocketAddr, ConfigError> {
    let host = vars
        .optional(host_var)
        .unwrap_or_else(|| host_default.to_string());
    let ip = validate_host(host_var, &host)?;
    let port = validate_port(port_var, vars.parse(port_var, port_default)?)?;
    Ok(SocketAddr::new(ip, port))
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.optional(name).ok_or_else(|| ConfigError::MissingEnvVar {
            var_name: name.to_string(),
        })
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: ToString,
    {
        match self.optional(name) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map_err(|e| invalid(name, &raw, &e.to_string())),
            None => Ok(default),
        }
    }
}

/// Application constants used throughout the system.
pub mod constants {
    /// Reply the collector sends for every stored frame.
    pub const ACK_TOKEN: &str = "ack";

    /// Reply the control listener sends for every command.
    pub const CONTROL_REPLY: &str = "ok";

    /// Reply the collector sends for a request it could not decode.
    pub const COLLECTOR_ERROR_REPLY: &str = "error";

    /// Liveness probe sent by the collector.
    pub const COMMAND_TEST: &str = "test";

    /// Switch capture to motion-only frames.
    pub const COMMAND_CAPTURE_MOTION: &str = "capture_mode_set_to_motion_detection";

    /// Switch capture to every frame.
    pub const COMMAND_CAPTURE_ALL: &str = "capture_mode_set_to_all_frames";

    /// Accepted port range for the collector and the control listener.
    pub const MIN_PORT: u16 = 1000;
    pub const MAX_PORT: u16 = 49152;

    pub const DEFAULT_FRAME_WIDTH: u32 = 640;
    pub const DEFAULT_FRAME_HEIGHT: u32 = 480;
    pub const DEFAULT_FRAME_RATE: u32 = 16;
    pub const DEFAULT_CAMERA_WARMUP_MS: u64 = 2500;

    pub const DEFAULT_MIN_AREA: u32 = 5000;
    pub const DEFAULT_DELTA_THRESHOLD: u8 = 5;
    pub const DEFAULT_BLEND_WEIGHT: f32 = 0.5;

    /// Roughly the spread of a 21x21 Gaussian kernel.
    pub const DEFAULT_BLUR_SIGMA: f32 = 3.5;

    /// Two passes of a 3x3 dilation.
    pub const DEFAULT_DILATE_RADIUS: u8 = 2;

    pub const DEFAULT_DEVICE_ID: &str = "1";
    pub const DEFAULT_COLLECTOR_HOST: &str = "192.168.1.36";
    pub const DEFAULT_COLLECTOR_PORT: u16 = 5555;
    pub const DEFAULT_CONTROL_BIND_HOST: &str = "0.0.0.0";
    pub const DEFAULT_CONTROL_PORT: u16 = 5556;

    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 2500;

    /// Malformed replies tolerated within one attempt before it counts as timed out.
    pub const MAX_MALFORMED_REPLIES: u32 = 3;

    pub const DEFAULT_STORAGE_ROOT: &str = ".";
    pub const DEFAULT_DISK_WARN_PERCENT: f64 = 80.0;
    pub const DEFAULT_DISK_CRITICAL_PERCENT: f64 = 89.0;
    pub const DEFAULT_DISK_FULL_PERCENT: f64 = 95.0;

    /// Extension of archived frames.
    pub const IMAGE_EXTENSION: &str = "jpg";

    /// Idle time after which the control listener drops a silent connection.
    pub const CONTROL_IDLE_TIMEOUT_SECONDS: u64 = 30;

    /// Maximum number of attempts when fetching a snapshot fails.
    pub const MAX_FETCH_RETRIES: u32 = 15;

    /// Delay between snapshot fetch attempts in seconds.
    pub const FETCH_RETRY_DELAY_SECONDS: u64 = 15;
}
