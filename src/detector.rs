use image::{GrayImage, Luma, Rgb};
use imageproc::distance_transform::Norm;
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::dilate;
use imageproc::rect::Rect;
use imageproc::region_labelling::{Connectivity, connected_components};
use log::{debug, info, warn};
use rusttype::{Font, Scale};
use std::fs;

use crate::config::MotionConfig;
use crate::error::{ConfigError, DetectionError};
use crate::frame::Frame;

/// Outline color for motion regions.
const REGION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Color of the capture time stamped on annotated frames.
const TEXT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Height of the stamped capture time in pixels.
const TEXT_SCALE: f32 = 14.0;

/// Motion detection against a running-average background model.
///
/// Each frame is converted to grayscale, optionally blurred, blended into
/// the background model, and compared with it. Pixels that changed by more
/// than the delta threshold are dilated into regions, and every region at
/// least `min_area` pixels large counts as motion.
pub struct MotionDetector {
    config: MotionConfig,
    background: Option<BackgroundModel>,
    font: Option<Font<'static>>,
}

impl MotionDetector {
    /// Create a new MotionDetector.
    ///
    /// # Errors
    ///
    /// Returns an error if an annotation font is configured but cannot be
    /// read or is not a TrueType font.
    pub fn new(config: MotionConfig) -> Result<Self, ConfigError> {
        let font = match &config.annotation_font {
            Some(path) => {
                let bytes = fs::read(path).map_err(|e| ConfigError::FileReadError {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                let font =
                    Font::try_from_vec(bytes).ok_or_else(|| ConfigError::FileReadError {
                        path: path.display().to_string(),
                        reason: "not a valid TrueType font".to_string(),
                    })?;
                Some(font)
            }
            None => {
                warn!("No ANNOTATION_FONT configured, motion frames will not carry a timestamp");
                None
            }
        };

        Ok(Self {
            config,
            background: None,
            font,
        })
    }

    /// Run motion detection on one frame.
    ///
    /// The first frame only seeds the background model and never reports
    /// motion. Later frames produce a single verdict listing every region
    /// that reached the minimum area.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame dimensions differ from the frames the
    /// background model was built from.
    pub fn detect(&mut self, frame: &Frame) -> Result<MotionVerdict, DetectionError> {
        let gray = self.preprocess(frame);

        let model = match self.background.as_mut() {
            Some(model) => model,
            None => {
                info!(
                    "Starting background model from a {}x{} frame",
                    gray.width(),
                    gray.height()
                );
                self.background = Some(BackgroundModel::new(&gray, self.config.blend_weight));
                return Ok(MotionVerdict::quiet(frame));
            }
        };

        model.accumulate(&gray)?;
        let mut mask = model.changed_pixels(&gray, self.config.delta_threshold);
        if self.config.dilate_radius > 0 {
            mask = dilate(&mask, Norm::LInf, self.config.dilate_radius);
        }

        let regions = find_regions(&mask, self.config.min_area);
        if regions.is_empty() {
            return Ok(MotionVerdict::quiet(frame));
        }

        debug!(
            "Motion detected in {} region(s), largest {} px",
            regions.len(),
            regions.iter().map(|r| r.area).max().unwrap_or(0)
        );

        Ok(MotionVerdict {
            detected: true,
            annotated_frame: self.annotate(frame, &regions),
            timestamp_label: frame.timestamp_label(),
            regions,
        })
    }

    /// The background model, once the first frame has been seen.
    pub fn background(&self) -> Option<&BackgroundModel> {
        self.background.as_ref()
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    fn preprocess(&self, frame: &Frame) -> GrayImage {
        let gray = image::imageops::grayscale(&frame.image);
        if self.config.blur_sigma > 0.0 {
            gaussian_blur_f32(&gray, self.config.blur_sigma)
        } else {
            gray
        }
    }

    fn annotate(&self, frame: &Frame, regions: &[MotionRegion]) -> Frame {
        let mut annotated = frame.clone();

        for region in regions {
            let rect = Rect::at(region.x as i32, region.y as i32).of_size(region.width, region.height);
            draw_hollow_rect_mut(&mut annotated.image, rect, REGION_COLOR);
        }

        if let Some(font) = &self.font {
            let text = frame.timestamp_text();
            draw_text_mut(
                &mut annotated.image,
                TEXT_COLOR,
                10,
                10,
                Scale::uniform(TEXT_SCALE),
                font,
                &text,
            );
        }

        annotated
    }
}

/// Per-pixel running average of the grayscale scene.
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    width: u32,
    height: u32,
    weight: f32,
    average: Vec<f32>,
}

impl BackgroundModel {
    /// Seed the model from a grayscale frame.
    pub fn new(gray: &GrayImage, weight: f32) -> Self {
        Self {
            width: gray.width(),
            height: gray.height(),
            weight,
            average: gray.as_raw().iter().map(|&v| f32::from(v)).collect(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Current average at a pixel.
    pub fn average_at(&self, x: u32, y: u32) -> f32 {
        self.average[(y * self.width + x) as usize]
    }

    /// Blend a frame into the model: `avg = (1 - w) * avg + w * gray`.
    pub fn accumulate(&mut self, gray: &GrayImage) -> Result<(), DetectionError> {
        if gray.dimensions() != self.dimensions() {
            return Err(DetectionError::DimensionMismatch {
                expected: self.dimensions(),
                actual: gray.dimensions(),
            });
        }

        let keep = 1.0 - self.weight;
        for (avg, &value) in self.average.iter_mut().zip(gray.as_raw()) {
            *avg = keep * *avg + self.weight * f32::from(value);
        }
        Ok(())
    }

    /// Binary mask (255 for changed) of pixels differing from the rounded
    /// background by more than `threshold`.
    fn changed_pixels(&self, gray: &GrayImage, threshold: u8) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            let background = self.average_at(x, y).round().clamp(0.0, 255.0) as u8;
            let delta = gray.get_pixel(x, y)[0].abs_diff(background);
            if delta > threshold { Luma([255]) } else { Luma([0]) }
        })
    }
}

/// Bounding box and pixel area of one connected motion region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub area: u32,
}

/// Outcome of running the detector on one frame.
#[derive(Debug, Clone)]
pub struct MotionVerdict {
    /// Whether at least one region reached the minimum area.
    pub detected: bool,

    /// The source frame, with region outlines and capture time drawn on it
    /// when motion was detected.
    pub annotated_frame: Frame,

    /// Filesystem-safe capture time, used to name stored frames.
    pub timestamp_label: String,

    /// Qualifying regions, in scan order.
    pub regions: Vec<MotionRegion>,
}

impl MotionVerdict {
    /// Verdict for a frame without motion.
    pub fn quiet(frame: &Frame) -> Self {
        Self {
            detected: false,
            annotated_frame: frame.clone(),
            timestamp_label: frame.timestamp_label(),
            regions: Vec::new(),
        }
    }
}

/// Label 8-connected foreground regions and keep those of at least `min_area` pixels.
fn find_regions(mask: &GrayImage, min_area: u32) -> Vec<MotionRegion> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    // Index 0 is the background label and stays empty.
    let mut bounds: Vec<Option<(u32, u32, u32, u32, u32)>> = Vec::new();
    for (x, y, pixel) in labels.enumerate_pixels() {
        let label = pixel[0] as usize;
        if label == 0 {
            continue;
        }
        if bounds.len() <= label {
            bounds.resize(label + 1, None);
        }
        bounds[label] = Some(match bounds[label] {
            None => (x, y, x, y, 1),
            Some((min_x, min_y, max_x, max_y, area)) => (
                min_x.min(x),
                min_y.min(y),
                max_x.max(x),
                max_y.max(y),
                area + 1,
            ),
        });
    }

    bounds
        .into_iter()
        .flatten()
        .filter(|&(_, _, _, _, area)| area >= min_area)
        .map(|(min_x, min_y, max_x, max_y, area)| MotionRegion {
            x: min_x,
            y: min_y,
            width: max_x - min_x + 1,
            height: max_y - min_y + 1,
            area,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    const SIZE: u32 = 40;

    fn exact_config(min_area: u32) -> MotionConfig {
        MotionConfig {
            min_area,
            delta_threshold: 5,
            blend_weight: 0.5,
            blur_sigma: 0.0,
            dilate_radius: 0,
            annotation_font: None,
        }
    }

    fn blank() -> Frame {
        Frame::now(RgbImage::new(SIZE, SIZE))
    }

    /// A black frame with white rectangles at `(x, y, w, h)`.
    fn with_patches(patches: &[(u32, u32, u32, u32)]) -> Frame {
        let mut image = RgbImage::new(SIZE, SIZE);
        for &(px, py, w, h) in patches {
            for y in py..py + h {
                for x in px..px + w {
                    image.put_pixel(x, y, Rgb([255, 255, 255]));
                }
            }
        }
        Frame::now(image)
    }

    #[test]
    fn first_frame_only_seeds_the_model() {
        let mut detector = MotionDetector::new(exact_config(1)).unwrap();
        assert!(detector.background().is_none());

        let verdict = detector.detect(&with_patches(&[(0, 0, 20, 20)])).unwrap();
        assert!(!verdict.detected);
        assert!(verdict.regions.is_empty());
        assert_eq!(detector.background().unwrap().average_at(5, 5), 255.0);

        // The second frame blends in instead of re-seeding.
        detector.detect(&blank()).unwrap();
        assert_eq!(detector.background().unwrap().average_at(5, 5), 127.5);
    }

    #[test]
    fn identical_frames_never_report_motion() {
        let mut detector = MotionDetector::new(MotionConfig {
            min_area: 1,
            ..MotionConfig::default()
        })
        .unwrap();
        let frame = with_patches(&[(3, 3, 10, 7), (25, 20, 5, 5)]);

        for _ in 0..10 {
            assert!(!detector.detect(&frame).unwrap().detected);
        }
    }

    #[test]
    fn region_exactly_at_min_area_is_motion() {
        let mut detector = MotionDetector::new(exact_config(100)).unwrap();
        detector.detect(&blank()).unwrap();

        let verdict = detector.detect(&with_patches(&[(5, 5, 10, 10)])).unwrap();
        assert!(verdict.detected);
        assert_eq!(
            verdict.regions,
            vec![MotionRegion {
                x: 5,
                y: 5,
                width: 10,
                height: 10,
                area: 100
            }]
        );
    }

    #[test]
    fn region_one_pixel_below_min_area_is_ignored() {
        let mut detector = MotionDetector::new(exact_config(100)).unwrap();
        detector.detect(&blank()).unwrap();

        let verdict = detector.detect(&with_patches(&[(5, 5, 9, 11)])).unwrap();
        assert!(!verdict.detected);
        assert!(verdict.regions.is_empty());
    }

    #[test]
    fn several_regions_yield_one_verdict() {
        let mut detector = MotionDetector::new(exact_config(20)).unwrap();
        let background = blank();
        detector.detect(&background).unwrap();

        let moving = with_patches(&[(2, 2, 5, 5), (20, 20, 6, 6), (35, 35, 2, 2)]);
        let verdict = detector.detect(&moving).unwrap();
        assert!(verdict.detected);
        assert_eq!(verdict.regions.len(), 2);
        assert_eq!(verdict.timestamp_label, moving.timestamp_label());

        // Region outlines are drawn on the copy, not the source.
        assert_eq!(*verdict.annotated_frame.image.get_pixel(20, 20), REGION_COLOR);
        assert_eq!(*moving.image.get_pixel(20, 20), Rgb([255, 255, 255]));
    }

    #[test]
    fn dilation_merges_nearby_regions() {
        let mut config = exact_config(1);
        config.dilate_radius = 2;
        let mut detector = MotionDetector::new(config).unwrap();
        detector.detect(&blank()).unwrap();

        let verdict = detector
            .detect(&with_patches(&[(10, 10, 3, 3), (15, 10, 3, 3)]))
            .unwrap();
        assert_eq!(verdict.regions.len(), 1);
    }

    #[test]
    fn default_tuning_detects_a_large_object() {
        let mut detector = MotionDetector::new(MotionConfig::default()).unwrap();
        let empty = Frame::now(RgbImage::new(200, 200));
        detector.detect(&empty).unwrap();

        let mut image = RgbImage::new(200, 200);
        for y in 50..150 {
            for x in 50..150 {
                image.put_pixel(x, y, Rgb([200, 180, 160]));
            }
        }
        let verdict = detector.detect(&Frame::now(image)).unwrap();
        assert!(verdict.detected);
        assert!(verdict.regions[0].area >= 5000);
    }

    #[test]
    fn rejects_frames_of_a_different_size() {
        let mut detector = MotionDetector::new(exact_config(1)).unwrap();
        detector.detect(&blank()).unwrap();

        let other = Frame::now(RgbImage::new(SIZE + 1, SIZE));
        assert!(matches!(
            detector.detect(&other),
            Err(DetectionError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn detected_frames_carry_the_capture_time() {
        let mut config = exact_config(20);
        config.annotation_font = Some(
            concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/DejaVuSansMono.ttf").into(),
        );
        let mut detector = MotionDetector::new(config).unwrap();
        detector.detect(&Frame::now(RgbImage::new(240, 80))).unwrap();

        let mut image = RgbImage::new(240, 80);
        for y in 60..70 {
            for x in 200..210 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let moving = Frame::now(image);
        let verdict = detector.detect(&moving).unwrap();
        assert!(verdict.detected);

        let is_text = |p: &Rgb<u8>| p[0] > 100 && p[1] == 0 && p[2] == 0;
        let stamped = (10..30)
            .flat_map(|y| (10..120).map(move |x| (x, y)))
            .filter(|&(x, y)| is_text(verdict.annotated_frame.image.get_pixel(x, y)))
            .count();
        assert!(stamped > 0, "no {:?} text pixels near (10, 10)", TEXT_COLOR);
        assert!(!moving.image.pixels().any(is_text));
    }

    #[test]
    fn missing_font_is_a_config_error() {
        let mut config = exact_config(1);
        config.annotation_font = Some("/nonexistent/font.ttf".into());
        assert!(MotionDetector::new(config).is_err());
    }
}
