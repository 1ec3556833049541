//! Named HSV colour classes.

use serde::{Deserialize, Serialize};

/// Threshold definition for one colour class.
///
/// Thresholds use the 8-bit HSV convention: hue in `0..180`, saturation and
/// value in `0..=255`. Both bounds are inclusive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorSpec {
    pub name: String,
    pub lower: [u8; 3],
    pub upper: [u8; 3],
    /// Display colour in BGR order.
    pub bgr: [u8; 3],
    pub action_id: i32,
    pub duration_ms: u32,
}

impl ColorSpec {
    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|c| self.lower[c] <= hsv[c] && hsv[c] <= self.upper[c])
    }

    /// Display colour as `#rrggbb`.
    pub fn hex(&self) -> String {
        let [b, g, r] = self.bgr;
        format!("#{r:02x}{g:02x}{b:02x}")
    }

    /// Whether every lower bound sits at or below its upper bound.
    pub fn is_well_formed(&self) -> bool {
        (0..3).all(|c| self.lower[c] <= self.upper[c])
    }
}

/// Convert one BGR pixel to 8-bit HSV.
pub fn bgr_to_hsv([b, g, r]: [u8; 3]) -> [u8; 3] {
    let (bf, gf, rf) = (f32::from(b), f32::from(g), f32::from(r));
    let max = bf.max(gf).max(rf);
    let min = bf.min(gf).min(rf);
    let delta = max - min;

    let s = if max > 0.0 { 255.0 * delta / max } else { 0.0 };

    let mut h = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (gf - bf) / delta
    } else if max == gf {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    if h < 0.0 {
        h += 360.0;
    }

    let hue = (h / 2.0).round() as u16 % 180;
    [hue as u8, s.round() as u8, max as u8]
}
