//! Captured frames and their byte encoding.
//!
//! Encoded frame layout (16 bytes header + pixels):
//! ```text
//! ┌──────────────┬──────────────┬──────────────────┬──────────────────────┐
//! │    height    │    width     │  captured (µs)   │  RGB pixels          │
//! │ (u32, BE)    │ (u32, BE)    │  (i64, BE)       │  height*width*3 bytes│
//! └──────────────┴──────────────┴──────────────────┴──────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Local, Utc};
use image::RgbImage;

use crate::error::FrameError;

/// Size of the encoded frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 4 + 4 + 8;

/// Human-readable capture time, also drawn on annotated frames.
const TIMESTAMP_FORMAT: &str = "%A %d %B %Y %I:%M:%S:%6f%p";

/// A single RGB camera frame with its capture time.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: DateTime<Local>,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: DateTime<Local>) -> Self {
        Self { image, captured_at }
    }

    /// Wrap an image captured right now.
    pub fn now(image: RgbImage) -> Self {
        Self::new(image, Local::now())
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Capture time formatted for display, e.g. `Monday 19 October 2026 03:04:05:000123PM`.
    pub fn timestamp_text(&self) -> String {
        self.captured_at.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Capture time usable as a file name: spaces and colons become underscores.
    pub fn timestamp_label(&self) -> String {
        filesystem_safe(&self.timestamp_text())
    }
}

/// Replace characters that are awkward in file names.
pub fn filesystem_safe(text: &str) -> String {
    text.replace([' ', ':'], "_")
}

/// Serialize a frame to bytes (header + pixels)
pub fn encode_frame(frame: &Frame) -> Bytes {
    let pixels = frame.image.as_raw();
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + pixels.len());

    buf.put_u32(frame.height());
    buf.put_u32(frame.width());
    buf.put_i64(frame.captured_at.timestamp_micros());
    buf.put_slice(pixels);

    buf.freeze()
}

/// Deserialize a frame from bytes
pub fn decode_frame(mut buf: &[u8]) -> Result<Frame, FrameError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::Truncated {
            expected: FRAME_HEADER_SIZE,
            actual: buf.len(),
        });
    }

    let height = buf.get_u32();
    let width = buf.get_u32();
    let micros = buf.get_i64();

    let captured_at = DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or(FrameError::InvalidTimestamp { micros })?
        .with_timezone(&Local);

    let mismatch = FrameError::SizeMismatch {
        width,
        height,
        pixel_bytes: buf.len(),
    };
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(3));
    if expected != Some(buf.len()) {
        return Err(mismatch);
    }

    let image = RgbImage::from_raw(width, height, buf.to_vec()).ok_or(mismatch)?;
    Ok(Frame { image, captured_at })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::Rgb;

    fn sample_frame() -> Frame {
        let image = RgbImage::from_fn(4, 3, |x, y| Rgb([x as u8, y as u8, 200]));
        let captured_at = Local.with_ymd_and_hms(2026, 10, 19, 15, 4, 5).unwrap();
        Frame::new(image, captured_at)
    }

    #[test]
    fn encoded_frame_decodes_to_the_same_frame() {
        let frame = sample_frame();
        let bytes = encode_frame(&frame);
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE + 4 * 3 * 3);

        let decoded = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_truncated_and_inconsistent_payloads() {
        assert!(matches!(
            decode_frame(&[0u8; 7]),
            Err(FrameError::Truncated { actual: 7, .. })
        ));

        let bytes = encode_frame(&sample_frame());
        assert!(matches!(
            decode_frame(&bytes[..bytes.len() - 1]),
            Err(FrameError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn timestamp_label_is_filesystem_safe() {
        let frame = sample_frame();
        assert_eq!(
            frame.timestamp_text(),
            "Monday 19 October 2026 03:04:05:000000PM"
        );
        assert_eq!(
            frame.timestamp_label(),
            "Monday_19_October_2026_03_04_05_000000PM"
        );
    }
}
