//! Overlay renderer: boxes, identity labels, trajectories and the FPS plate.
//!
//! Pixels stay in BGR order throughout; the `Rgb`/`Rgba` image types are used
//! purely as 3- and 4-channel containers.

use std::time::Duration;

use anyhow::{Result, anyhow};
use image::{ImageBuffer, Pixel, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut},
    rect::Rect,
};
use video_ingest::Frame;
use vision::{BoundingBox, Detection, FrameRenderer, Scene, TrackId};

use crate::config::DrawingSection;

/// Max centroid offset, per axis, for a tracked box to borrow a detection's colour.
const MATCH_TOLERANCE: i64 = 5;
const GLYPH_ADVANCE: i32 = 6;
const GLYPH_HEIGHT: i32 = 7;
const ARROW_TIP_RATIO: f32 = 0.3;

#[derive(Clone, Debug)]
pub struct OverlayRenderer {
    show_fps: bool,
    alpha: f32,
    trajectory_ttl: Duration,
}

impl OverlayRenderer {
    pub fn new(drawing: &DrawingSection) -> Self {
        Self {
            show_fps: drawing.show_fps,
            alpha: drawing.alpha.clamp(0.0, 1.0),
            trajectory_ttl: Duration::from_secs_f64(drawing.trajectory_ttl.max(0.0)),
        }
    }
}

impl FrameRenderer for OverlayRenderer {
    fn render(&self, scene: &Scene<'_>) -> Result<Frame> {
        let frame = scene.frame;
        let expected = frame.expected_len();
        let pixels = frame
            .data
            .get(..expected)
            .ok_or_else(|| anyhow!("frame buffer shorter than {expected} bytes"))?;
        let mut base = RgbImage::from_raw(frame.width, frame.height, pixels.to_vec())
            .ok_or_else(|| anyhow!("failed to wrap {}x{} frame", frame.width, frame.height))?;
        let mut overlay = RgbaImage::new(frame.width, frame.height);

        for tracked in scene.tracked {
            let Some(detection) = matching_detection(scene.detections, &tracked.bbox) else {
                continue;
            };
            let [b, g, r] = detection.spec.bgr;
            let color = Rgba([b, g, r, 255]);
            draw_box(&mut overlay, &tracked.bbox, color);
            draw_identity_label(&mut overlay, &tracked.bbox, &detection.spec.name, tracked.id);

            let trail = scene.tracker.trajectory(tracked.id, self.trajectory_ttl);
            draw_trajectory(&mut overlay, &trail, color);
        }

        blend(&mut base, &overlay, self.alpha);

        if self.show_fps {
            draw_fps(&mut base, scene.fps);
        }

        Ok(Frame {
            data: base.into_raw(),
            ..frame.clone()
        })
    }
}

fn matching_detection<'a>(detections: &'a [Detection], bbox: &BoundingBox) -> Option<&'a Detection> {
    let (cx, cy) = bbox.centroid();
    detections.iter().find(|detection| {
        let (dx, dy) = detection.bbox.centroid();
        (dx - cx).abs() < MATCH_TOLERANCE && (dy - cy).abs() < MATCH_TOLERANCE
    })
}

fn draw_box(image: &mut RgbaImage, bbox: &BoundingBox, color: Rgba<u8>) {
    if bbox.w == 0 || bbox.h == 0 {
        return;
    }
    let (x, y) = (bbox.x as i32, bbox.y as i32);
    draw_hollow_rect_mut(image, Rect::at(x, y).of_size(bbox.w, bbox.h), color);
    if bbox.w > 2 && bbox.h > 2 {
        draw_hollow_rect_mut(
            image,
            Rect::at(x + 1, y + 1).of_size(bbox.w - 2, bbox.h - 2),
            color,
        );
    }
}

fn draw_identity_label(image: &mut RgbaImage, bbox: &BoundingBox, name: &str, id: TrackId) {
    let text = format!("{name} | ID:{id}");
    let x = bbox.x as i32;
    let y = (bbox.y as i32 - GLYPH_HEIGHT - 5).max(0);
    fill_rect(
        image,
        x,
        y,
        x + text_width(&text) + 3,
        y + GLYPH_HEIGHT + 3,
        Rgba([0, 0, 0, 255]),
    );
    draw_label(image, x + 2, y + 2, &text, Rgba([255, 255, 255, 255]));
}

fn draw_trajectory(image: &mut RgbaImage, points: &[(i64, i64)], color: Rgba<u8>) {
    for pair in points.windows(2) {
        thick_segment(image, to_f32(pair[0]), to_f32(pair[1]), color);
    }
    if let [.., from, tip] = points {
        draw_arrow_head(image, to_f32(*from), to_f32(*tip), color);
    }
}

fn draw_arrow_head(image: &mut RgbaImage, from: (f32, f32), tip: (f32, f32), color: Rgba<u8>) {
    let (dx, dy) = (from.0 - tip.0, from.1 - tip.1);
    let length = dx.hypot(dy);
    if length < f32::EPSILON {
        return;
    }
    let head = (length * ARROW_TIP_RATIO).max(4.0);
    let (ux, uy) = (dx / length, dy / length);
    let (sin, cos) = std::f32::consts::FRAC_PI_6.sin_cos();
    for side in [1.0_f32, -1.0] {
        let wx = ux * cos - side * uy * sin;
        let wy = side * ux * sin + uy * cos;
        thick_segment(image, tip, (tip.0 + wx * head, tip.1 + wy * head), color);
    }
}

fn thick_segment(image: &mut RgbaImage, start: (f32, f32), end: (f32, f32), color: Rgba<u8>) {
    draw_line_segment_mut(image, start, end, color);
    draw_line_segment_mut(image, (start.0 + 1.0, start.1), (end.0 + 1.0, end.1), color);
    draw_line_segment_mut(image, (start.0, start.1 + 1.0), (end.0, end.1 + 1.0), color);
}

fn to_f32((x, y): (i64, i64)) -> (f32, f32) {
    (x as f32, y as f32)
}

/// Mix every drawn overlay pixel into `base` at `alpha`; undrawn pixels are left as is.
fn blend(base: &mut RgbImage, overlay: &RgbaImage, alpha: f32) {
    for (dst, src) in base.pixels_mut().zip(overlay.pixels()) {
        if src[3] == 0 {
            continue;
        }
        for channel in 0..3 {
            let mixed = f32::from(src[channel]) * alpha + f32::from(dst[channel]) * (1.0 - alpha);
            dst[channel] = mixed.round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn draw_fps(image: &mut RgbImage, fps: f64) {
    let text = format!("FPS: {fps:.1}");
    let width = image.width() as i32;
    let plate_width = text_width(&text) + 4;
    let x = (width - plate_width - 6).max(0);
    let y = 6;
    if plate_width > 0 {
        draw_filled_rect_mut(
            image,
            Rect::at(x, y).of_size(plate_width as u32, (GLYPH_HEIGHT + 4) as u32),
            Rgb([255, 255, 255]),
        );
    }
    draw_label(image, x + 2, y + 2, &text, Rgb([0, 0, 0]));
}

fn text_width(text: &str) -> i32 {
    text.chars().count() as i32 * GLYPH_ADVANCE
}

fn fill_rect<P: Pixel>(
    image: &mut ImageBuffer<P, Vec<P::Subpixel>>,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: P,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label<P: Pixel>(
    image: &mut ImageBuffer<P, Vec<P::Subpixel>>,
    mut x: i32,
    y: i32,
    text: &str,
    color: P,
) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    let px = x + col;
                    if (pattern >> (4 - col)) & 1 == 1 && px >= 0 && px < width {
                        image.put_pixel(px as u32, py as u32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ':' => [0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0],
        '|' => [0b00100; 7],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}
