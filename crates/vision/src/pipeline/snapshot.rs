//! Externally visible pipeline output and its JSON shapes.

use serde::Serialize;

use crate::{
    classifier::Detection,
    geometry::BoundingBox,
    pipeline::watchdog::HealthComponent,
    tracker::TrackId,
};

/// One published detection cycle. Replaced wholesale each cycle.
#[derive(Clone, Debug, Default)]
pub struct PipelineSnapshot {
    /// JPEG of the rendered frame; empty until the first cycle completes.
    pub jpeg: Vec<u8>,
    pub detections: Vec<Detection>,
    pub tracked: Vec<TrackedBox>,
    pub fps: f64,
    pub frame_sequence: u64,
    pub timestamp_ms: i64,
}

impl PipelineSnapshot {
    pub fn has_frame(&self) -> bool {
        !self.jpeg.is_empty()
    }

    pub fn detection_records(&self) -> Vec<DetectionRecord> {
        self.detections.iter().map(DetectionRecord::from).collect()
    }

    pub fn tracked_records(&self) -> Vec<TrackedRecord> {
        self.tracked.iter().map(TrackedRecord::from).collect()
    }
}

/// Identity assigned to a box during the cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackedBox {
    pub id: TrackId,
    pub bbox: BoundingBox,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRecord {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub name: String,
    /// Display colour as `[b, g, r]`.
    pub color: [u8; 3],
    pub action_id: i32,
    pub duration_ms: u32,
}

impl From<&Detection> for DetectionRecord {
    fn from(detection: &Detection) -> Self {
        let BoundingBox { x, y, w, h } = detection.bbox;
        Self {
            x,
            y,
            w,
            h,
            name: detection.spec.name.clone(),
            color: detection.spec.bgr,
            action_id: detection.spec.action_id,
            duration_ms: detection.spec.duration_ms,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackedRecord {
    pub id: TrackId,
    #[serde(flatten)]
    pub bbox: BoundingBox,
}

impl From<&TrackedBox> for TrackedRecord {
    fn from(tracked: &TrackedBox) -> Self {
        Self {
            id: tracked.id,
            bbox: tracked.bbox,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub running: bool,
    pub source_healthy: bool,
    pub detected: usize,
    pub tracked: usize,
    pub fps: f64,
    pub stalled: Option<HealthComponent>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::color::ColorSpec;

    #[test]
    fn records_use_wire_field_names() {
        let detection = Detection {
            bbox: BoundingBox::new(1, 2, 3, 4),
            spec: ColorSpec {
                name: "blue".into(),
                lower: [100, 150, 0],
                upper: [140, 255, 255],
                bgr: [255, 0, 0],
                action_id: 5,
                duration_ms: 700,
            },
        };
        let record = serde_json::to_value(DetectionRecord::from(&detection)).unwrap();
        assert_eq!(
            record,
            json!({
                "x": 1, "y": 2, "w": 3, "h": 4,
                "name": "blue", "color": [255, 0, 0],
                "actionId": 5, "durationMs": 700
            })
        );

        let tracked = TrackedBox {
            id: "0000002a".parse().unwrap(),
            bbox: BoundingBox::new(5, 6, 7, 8),
        };
        let record = serde_json::to_value(TrackedRecord::from(&tracked)).unwrap();
        assert_eq!(record, json!({"id": "0000002a", "x": 5, "y": 6, "w": 7, "h": 8}));
    }

    #[test]
    fn status_serialises_lowercase_state() {
        let status = PipelineStatus {
            state: PipelineState::Running,
            running: true,
            source_healthy: true,
            detected: 2,
            tracked: 1,
            fps: 12.5,
            stalled: Some(HealthComponent::Capture),
        };
        let value = serde_json::to_value(status).unwrap();
        assert_eq!(value["state"], "running");
        assert_eq!(value["stalled"], "capture");
    }
}
