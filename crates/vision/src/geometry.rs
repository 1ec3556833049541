use serde::{Deserialize, Serialize};

/// Axis-aligned pixel rectangle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Integer centre, rounded towards the top-left corner.
    pub fn centroid(&self) -> (i64, i64) {
        (
            i64::from(self.x) + i64::from(self.w / 2),
            i64::from(self.y) + i64::from(self.h / 2),
        )
    }

    pub fn area(&self) -> u64 {
        u64::from(self.w) * u64::from(self.h)
    }
}

/// Euclidean distance between two integer points.
pub fn distance(a: (i64, i64), b: (i64, i64)) -> f64 {
    let dx = (a.0 - b.0) as f64;
    let dy = (a.1 - b.1) as f64;
    dx.hypot(dy)
}
