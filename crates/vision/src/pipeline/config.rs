//! Settings consumed by [`Pipeline`](super::Pipeline).

use std::time::Duration;

use video_ingest::CaptureSettings;

use crate::tracker::TrackerConfig;

#[derive(Clone, Debug, PartialEq)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct PipelineConfig {
    /// Geometry, rate and reconnect delay requested from the frame source.
    pub capture: CaptureSettings,
    /// Smallest region area, in pixels, reported as a detection.
    pub min_area: f64,
    /// Upper bound on detection cycles per second.
    pub max_detection_fps: f64,
    pub tracker: TrackerConfig,
    /// JPEG quality for published snapshots, clamped to `1..=100`.
    pub jpeg_quality: u8,
    /// Back-off when no new frame is available.
    pub idle_sleep: Duration,
    /// Bound on how long `stop()` waits for the detection thread.
    pub stop_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            min_area: 1500.0,
            max_detection_fps: 30.0,
            tracker: TrackerConfig::default(),
            jpeg_quality: 80,
            idle_sleep: Duration::from_millis(5),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    /// Minimum spacing between the starts of two detection cycles.
    pub fn detection_interval(&self) -> Duration {
        if self.max_detection_fps > 0.0 {
            Duration::from_secs_f64(1.0 / self.max_detection_fps)
        } else {
            Duration::ZERO
        }
    }
}
