use anyhow::{Context, Result};
use image::RgbImage;
use image::imageops::FilterType;
use log::{debug, info, warn};
use reqwest::blocking::Client;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::frame::Frame;

/// Anything that yields camera frames.
pub trait FrameSource {
    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame>;
}

/// Frame source polling a camera snapshot URL over HTTP.
///
/// Each call downloads one still image, retrying failed downloads with a
/// fixed delay, and normalizes it to the configured frame size. Calls are
/// paced so frames are produced no faster than the configured frame rate.
pub struct SnapshotSource {
    client: Client,
    image_url: String,
    size: (u32, u32),
    flip_vertical: bool,
    max_retries: u32,
    retry_delay: Duration,
    frame_interval: Duration,
    last_capture: Option<Instant>,
}

impl SnapshotSource {
    pub fn new(image_url: impl Into<String>, width: u32, height: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            image_url: image_url.into(),
            size: (width, height),
            flip_vertical: false,
            max_retries: crate::config::constants::MAX_FETCH_RETRIES,
            retry_delay: Duration::from_secs(crate::config::constants::FETCH_RETRY_DELAY_SECONDS),
            frame_interval: Duration::ZERO,
            last_capture: None,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(&config.image_url, config.frame_width, config.frame_height)?
            .with_flip(config.flip_image)
            .with_retries(config.max_fetch_retries, config.fetch_retry_delay)
            .with_frame_interval(config.frame_interval()))
    }

    /// Flip frames vertically, for cameras mounted upside down.
    pub fn with_flip(mut self, flip_vertical: bool) -> Self {
        self.flip_vertical = flip_vertical;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_frame_interval(mut self, frame_interval: Duration) -> Self {
        self.frame_interval = frame_interval;
        self
    }

    fn fetch_with_retry(&self) -> Result<Vec<u8>> {
        let mut retry_count = 0;
        loop {
            match self.attempt_fetch() {
                Ok(data) => return Ok(data),
                Err(e) => {
                    retry_count += 1;
                    warn!(
                        "Failed to fetch image from {} (attempt {}): {}",
                        self.image_url, retry_count, e
                    );

                    if retry_count >= self.max_retries {
                        anyhow::bail!(
                            "Failed to fetch image from {} after {} retries",
                            self.image_url,
                            self.max_retries
                        );
                    }

                    info!("Retrying in {:?}...", self.retry_delay);
                    thread::sleep(self.retry_delay);
                }
            }
        }
    }

    fn attempt_fetch(&self) -> Result<Vec<u8>> {
        let response = self.client.get(&self.image_url).send()?;

        if !response.status().is_success() {
            anyhow::bail!("HTTP request failed with status: {}", response.status());
        }

        Ok(response.bytes()?.to_vec())
    }

    fn pace(&mut self) {
        if let Some(last) = self.last_capture {
            let elapsed = last.elapsed();
            if elapsed < self.frame_interval {
                thread::sleep(self.frame_interval - elapsed);
            }
        }
        self.last_capture = Some(Instant::now());
    }
}

impl FrameSource for SnapshotSource {
    fn next_frame(&mut self) -> Result<Frame> {
        self.pace();
        let data = self.fetch_with_retry()?;
        let image = prepare_image(&data, self.size, self.flip_vertical)?;
        debug!("Captured {}x{} frame", image.width(), image.height());
        Ok(Frame::now(image))
    }
}

/// Decode an encoded still and normalize it to `size`.
pub fn prepare_image(data: &[u8], size: (u32, u32), flip_vertical: bool) -> Result<RgbImage> {
    let mut image = image::load_from_memory(data).context("Failed to decode camera image")?;

    if image.width() != size.0 || image.height() != size.1 {
        image = image.resize_exact(size.0, size.1, FilterType::Triangle);
    }
    if flip_vertical {
        image = image.flipv();
    }

    Ok(image.to_rgb8())
}
