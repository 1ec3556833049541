//! Camera service: the pipeline plus the colour catalogue it reloads from.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use tracing::{info, warn};
use vision::{ColorSpec, Pipeline, PipelineSnapshot, PipelineState, PipelineStatus};

use crate::{
    annotation::OverlayRenderer,
    config::{CameraFile, ColorCatalog, ColorEntry},
};

pub struct CameraService {
    pipeline: Pipeline,
    colors: Mutex<ColorCatalog>,
    /// Serialises start/stop so a source override cannot race a restart.
    control: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CameraService {
    pub fn new(camera: &CameraFile, colors: ColorCatalog, jpeg_quality: u8, source: String) -> Self {
        let pipeline = Pipeline::new(
            camera.to_pipeline_config(jpeg_quality),
            source,
            colors.specs().to_vec(),
        );
        pipeline.set_renderer(Arc::new(OverlayRenderer::new(&camera.drawing)));
        Self::from_parts(pipeline, colors)
    }

    pub(crate) fn from_parts(pipeline: Pipeline, colors: ColorCatalog) -> Self {
        Self {
            pipeline,
            colors: Mutex::new(colors),
            control: Mutex::new(()),
        }
    }

    /// Start the pipeline, optionally against a different source.
    ///
    /// A running pipeline is left alone unless `source` asks for a new one,
    /// in which case it is restarted. An override that fails to open is not
    /// kept: the previous source is reinstated and resumed if it was running.
    pub fn start(&self, source: Option<String>) -> Result<PipelineStatus> {
        let _control = lock(&self.control);
        let Some(source) = source else {
            self.pipeline.start().context("camera failed to start")?;
            return Ok(self.pipeline.status());
        };

        info!(%source, "camera source override");
        let previous = self.pipeline.source_factory();
        let was_running = self.pipeline.state() != PipelineState::Stopped;
        self.pipeline.stop();
        self.pipeline.set_source(source.as_str());
        if let Err(err) = self.pipeline.start() {
            self.pipeline.set_source_factory(previous);
            if was_running {
                if let Err(resume) = self.pipeline.start() {
                    warn!(error = %resume, "previous camera source did not resume");
                }
            }
            return Err(err).with_context(|| format!("camera source {source} failed to start"));
        }
        Ok(self.pipeline.status())
    }

    pub fn stop(&self) -> PipelineStatus {
        let _control = lock(&self.control);
        self.pipeline.stop();
        self.pipeline.status()
    }

    pub fn status(&self) -> PipelineStatus {
        self.pipeline.status()
    }

    pub fn snapshot(&self) -> Arc<PipelineSnapshot> {
        self.pipeline.latest_snapshot()
    }

    pub fn colors(&self) -> Vec<ColorSpec> {
        self.pipeline.color_specs().to_vec()
    }

    /// Persist `entries` and hot-reload the pipeline with the merged set.
    pub fn save_colors(&self, entries: &[ColorEntry]) -> Result<Vec<ColorSpec>> {
        let mut catalog = lock(&self.colors);
        let specs = catalog.save(entries)?.to_vec();
        self.pipeline.set_color_specs(specs.clone());
        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use video_ingest::{CaptureError, CaptureSession, Connector, Frame, FrameSource};

    use super::*;

    struct Belt;

    struct BeltSession;

    impl Connector for Belt {
        fn kind(&self) -> &'static str {
            "belt"
        }

        fn describe(&self) -> String {
            "fake://belt".into()
        }

        fn connect(&mut self) -> Result<Box<dyn CaptureSession>, CaptureError> {
            Ok(Box::new(BeltSession))
        }
    }

    impl CaptureSession for BeltSession {
        fn grab(&mut self) -> Result<Frame, CaptureError> {
            let mut frame = Frame::filled(80, 60, [30, 30, 30]);
            for y in 10..40 {
                for x in 10..40 {
                    frame.set_pixel(x, y, [0, 0, 255]);
                }
            }
            Ok(frame)
        }
    }

    fn service(dir: &tempfile::TempDir) -> CameraService {
        let catalog = ColorCatalog::load_or_create(&dir.path().join("colors.json")).unwrap();
        let mut camera = CameraFile::default();
        camera.camera.fps = 50.0;
        camera.detection.min_contour_area = 100.0;
        let pipeline = Pipeline::with_source_factory(
            camera.to_pipeline_config(70),
            catalog.specs().to_vec(),
            |settings| FrameSource::with_connector(Box::new(Belt), settings.clone()),
        );
        pipeline.set_renderer(Arc::new(OverlayRenderer::new(&camera.drawing)));
        CameraService::from_parts(pipeline, catalog)
    }

    #[test]
    fn saving_colours_hot_reloads_the_running_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        assert_eq!(service.colors().len(), 7);

        let status = service.start(None).unwrap();
        assert_eq!(status.state, PipelineState::Running);

        let saved = service
            .save_colors(&[ColorEntry {
                name: "red".into(),
                action_id: Some(11),
                duration_ms: None,
                lower: None,
                upper: None,
                bgr: None,
            }])
            .unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(service.colors(), saved);

        let mut seen = false;
        for _ in 0..200 {
            let snapshot = service.snapshot();
            if let Some(detection) = snapshot.detections.first() {
                if detection.spec.action_id == 11 {
                    seen = true;
                    break;
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(seen, "reloaded action id never reached a snapshot");

        assert_eq!(service.stop().state, PipelineState::Stopped);
    }

    #[test]
    fn failed_override_resumes_the_previous_source() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        service.start(None).unwrap();

        let err = service.start(Some("/nonexistent/camera".into())).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/camera"));
        let status = service.status();
        assert_eq!(status.state, PipelineState::Running);
        assert!(status.source_healthy);

        // The override is gone for later starts too.
        service.stop();
        assert_eq!(service.start(None).unwrap().state, PipelineState::Running);
        service.stop();
    }

    #[test]
    fn failed_override_on_a_stopped_pipeline_stays_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);

        assert!(service.start(Some("/nonexistent/camera".into())).is_err());
        assert_eq!(service.status().state, PipelineState::Stopped);
        assert_eq!(service.start(None).unwrap().state, PipelineState::Running);
        service.stop();
    }

    #[test]
    fn rejected_save_keeps_the_active_set() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let before = service.colors();

        // A directory in place of the file makes the write fail.
        std::fs::remove_file(dir.path().join("colors.json")).unwrap();
        std::fs::create_dir(dir.path().join("colors.json")).unwrap();
        let entries: Vec<ColorEntry> = before.iter().map(ColorEntry::from).collect();
        assert!(service.save_colors(&entries[..1]).is_err());
        assert_eq!(service.colors(), before);
    }
}
