//! Colour segmentation, identity tracking and the detection pipeline that
//! drives them over a live frame source.

pub mod classifier;
pub mod color;
pub mod geometry;
pub mod pipeline;
pub mod tracker;

pub use classifier::{ColorClassifier, Detection, detect};
pub use color::{ColorSpec, bgr_to_hsv};
pub use geometry::BoundingBox;
pub use pipeline::{
    FrameRenderer, PassthroughRenderer, Pipeline, PipelineConfig, PipelineError,
    PipelineSnapshot, PipelineState, PipelineStatus, Scene, SourceFactory, TrackedBox,
};
pub use tracker::{IdentityTracker, TrackId, TrackedObject, TrackerConfig, TrajectoryPoint};
