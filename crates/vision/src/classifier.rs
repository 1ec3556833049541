//! Threshold segmentation of BGR frames into coloured regions.

use std::sync::{Arc, RwLock};

use image::{GrayImage, Luma};
use imageproc::{
    contours::{BorderType, Contour, find_contours},
    distance_transform::Norm,
    filter::median_filter,
    morphology,
};
use tracing::trace;
use video_ingest::Frame;

use crate::{color::ColorSpec, color::bgr_to_hsv, geometry::BoundingBox};

/// Median filter window is `2 * MEDIAN_RADIUS + 1` pixels wide.
const MEDIAN_RADIUS: u32 = 2;
/// Structuring element radius for opening/closing (5x5 window).
const MORPH_RADIUS: u8 = 2;

/// One region of a single frame that matched a colour class.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub spec: ColorSpec,
}

/// Segment `frame` against every spec and return the surviving regions.
///
/// Regions with a polygon area below `min_area` are dropped. Specs are
/// processed independently, so overlapping thresholds yield overlapping
/// detections.
pub fn detect(frame: Option<&Frame>, specs: &[ColorSpec], min_area: f64) -> Vec<Detection> {
    let Some(frame) = frame else {
        return Vec::new();
    };
    if specs.is_empty() || frame.is_empty() || frame.data.len() < frame.expected_len() {
        return Vec::new();
    }

    let hsv = to_hsv(frame);
    let mut detections = Vec::new();
    for spec in specs {
        let mask = denoise(&threshold_mask(&hsv, frame.width, frame.height, spec));
        for contour in find_contours::<i32>(&mask) {
            if contour.border_type != BorderType::Outer || contour.parent.is_some() {
                continue;
            }
            if contour_area(&contour) < min_area {
                continue;
            }
            if let Some(bbox) = bounding_rect(&contour) {
                detections.push(Detection {
                    bbox,
                    spec: spec.clone(),
                });
            }
        }
    }
    trace!(count = detections.len(), "colour regions");
    detections
}

fn to_hsv(frame: &Frame) -> Vec<[u8; 3]> {
    frame
        .data
        .chunks_exact(3)
        .take((frame.width as usize) * (frame.height as usize))
        .map(|px| bgr_to_hsv([px[0], px[1], px[2]]))
        .collect()
}

fn threshold_mask(hsv: &[[u8; 3]], width: u32, height: u32, spec: &ColorSpec) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let idx = (y as usize) * (width as usize) + x as usize;
        if spec.contains(hsv[idx]) {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Median blur, then opening to drop speckles and closing to fill pinholes.
fn denoise(mask: &GrayImage) -> GrayImage {
    let blurred = median_filter(mask, MEDIAN_RADIUS, MEDIAN_RADIUS);
    let opened = morphology::open(&blurred, Norm::LInf, MORPH_RADIUS);
    morphology::close(&opened, Norm::LInf, MORPH_RADIUS)
}

/// Polygon area enclosed by the contour's boundary pixels.
fn contour_area(contour: &Contour<i32>) -> f64 {
    let points = &contour.points;
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| i64::from(a.x) * i64::from(b.y) - i64::from(b.x) * i64::from(a.y))
        .sum();
    (twice as f64).abs() / 2.0
}

fn bounding_rect(contour: &Contour<i32>) -> Option<BoundingBox> {
    let first = contour.points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in &contour.points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Some(BoundingBox::new(
        min_x.max(0) as u32,
        min_y.max(0) as u32,
        (max_x - min_x + 1) as u32,
        (max_y - min_y + 1) as u32,
    ))
}

/// Classifier holding the active colour set, swappable while detection runs.
pub struct ColorClassifier {
    specs: RwLock<Arc<[ColorSpec]>>,
    min_area: f64,
}

impl ColorClassifier {
    pub fn new(specs: Vec<ColorSpec>, min_area: f64) -> Self {
        Self {
            specs: RwLock::new(specs.into()),
            min_area,
        }
    }

    /// The colour set currently in use.
    pub fn specs(&self) -> Arc<[ColorSpec]> {
        match self.specs.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the whole colour set. Calls already in flight keep the old set.
    pub fn replace_specs(&self, specs: Vec<ColorSpec>) {
        let next: Arc<[ColorSpec]> = specs.into();
        match self.specs.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn min_area(&self) -> f64 {
        self.min_area
    }

    pub fn classify(&self, frame: Option<&Frame>) -> Vec<Detection> {
        let specs = self.specs();
        detect(frame, &specs, self.min_area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: [u8; 3] = [0, 0, 255];
    const BLUE: [u8; 3] = [255, 0, 0];

    fn spec(name: &str, lower: [u8; 3], upper: [u8; 3], bgr: [u8; 3]) -> ColorSpec {
        ColorSpec {
            name: name.into(),
            lower,
            upper,
            bgr,
            action_id: 1,
            duration_ms: 250,
        }
    }

    fn red() -> ColorSpec {
        spec("red", [0, 120, 70], [10, 255, 255], RED)
    }

    fn blue() -> ColorSpec {
        spec("blue", [100, 150, 0], [140, 255, 255], BLUE)
    }

    fn paint(frame: &mut Frame, x0: u32, y0: u32, w: u32, h: u32, bgr: [u8; 3]) {
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                frame.set_pixel(x, y, bgr);
            }
        }
    }

    #[test]
    fn absent_frame_yields_nothing() {
        assert!(detect(None, &[red()], 10.0).is_empty());
    }

    #[test]
    fn finds_one_region_per_blob_with_its_spec() {
        let mut frame = Frame::filled(160, 120, [30, 30, 30]);
        paint(&mut frame, 10, 10, 40, 30, RED);
        paint(&mut frame, 100, 60, 30, 30, BLUE);

        let mut found = detect(Some(&frame), &[red(), blue()], 100.0);
        found.sort_by_key(|d| d.bbox.x);

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].spec.name, "red");
        assert_eq!(found[0].bbox, BoundingBox::new(10, 10, 40, 30));
        assert_eq!(found[1].spec.name, "blue");
        assert_eq!(found[1].bbox, BoundingBox::new(100, 60, 30, 30));
    }

    #[test]
    fn small_regions_and_speckles_are_dropped() {
        let mut frame = Frame::filled(120, 120, [30, 30, 30]);
        paint(&mut frame, 10, 10, 12, 12, RED);
        paint(&mut frame, 80, 80, 1, 1, RED);

        assert!(detect(Some(&frame), &[red()], 200.0).is_empty());
        let kept = detect(Some(&frame), &[red()], 50.0);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].bbox, BoundingBox::new(10, 10, 12, 12));
    }

    #[test]
    fn overlapping_specs_are_not_deduplicated() {
        let mut frame = Frame::filled(100, 100, [30, 30, 30]);
        paint(&mut frame, 20, 20, 30, 30, RED);
        let wide_red = spec("warm", [0, 50, 50], [20, 255, 255], [0, 128, 255]);

        let found = detect(Some(&frame), &[red(), wide_red], 100.0);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].bbox, found[1].bbox);
    }

    #[test]
    fn replacing_with_empty_set_disables_detection() {
        let mut frame = Frame::filled(100, 100, [30, 30, 30]);
        paint(&mut frame, 20, 20, 30, 30, RED);
        let classifier = ColorClassifier::new(vec![red()], 100.0);
        assert_eq!(classifier.classify(Some(&frame)).len(), 1);

        let held = classifier.specs();
        classifier.replace_specs(Vec::new());
        assert!(classifier.classify(Some(&frame)).is_empty());
        assert_eq!(held.len(), 1, "earlier view stays consistent");
    }
}
