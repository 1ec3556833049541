//! Seam between the detection loop and whatever draws the overlay.

use anyhow::Result;
use video_ingest::Frame;

use crate::{classifier::Detection, pipeline::snapshot::TrackedBox, tracker::IdentityTracker};

/// Everything a renderer may draw for one cycle.
pub struct Scene<'a> {
    pub frame: &'a Frame,
    pub detections: &'a [Detection],
    pub tracked: &'a [TrackedBox],
    /// Read-only access for trajectory lookups.
    pub tracker: &'a IdentityTracker,
    pub fps: f64,
}

/// Produces the frame that gets published. Errors are logged by the caller,
/// which then publishes the undrawn frame.
pub trait FrameRenderer: Send + Sync {
    fn render(&self, scene: &Scene<'_>) -> Result<Frame>;
}

/// Publishes frames untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughRenderer;

impl FrameRenderer for PassthroughRenderer {
    fn render(&self, scene: &Scene<'_>) -> Result<Frame> {
        Ok(scene.frame.clone())
    }
}

impl<F> FrameRenderer for F
where
    F: Fn(&Scene<'_>) -> Result<Frame> + Send + Sync,
{
    fn render(&self, scene: &Scene<'_>) -> Result<Frame> {
        self(scene)
    }
}
