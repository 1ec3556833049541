//! Rate-limited detection loop tying frame acquisition, colour classification
//! and identity tracking together.
//!
//! Lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`. The
//! source is opened synchronously in `start()`, so an unreachable camera is
//! reported to the caller and the pipeline stays stopped. Once running, each
//! cycle reads the newest frame, classifies it, updates the tracker, renders,
//! encodes and publishes a fresh [`PipelineSnapshot`].

pub mod config;
pub mod encoding;
pub mod render;
pub mod snapshot;
pub mod telemetry;
pub mod watchdog;

use std::{
    borrow::Cow,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{CaptureError, CaptureSettings, Frame, FrameSource};

use crate::{
    classifier::ColorClassifier,
    color::ColorSpec,
    geometry::BoundingBox,
    tracker::IdentityTracker,
};

pub use self::{
    config::PipelineConfig,
    encoding::encode_jpeg,
    render::{FrameRenderer, PassthroughRenderer, Scene},
    snapshot::{
        DetectionRecord, PipelineSnapshot, PipelineState, PipelineStatus, TrackedBox,
        TrackedRecord,
    },
    telemetry::{RollingFps, spawn_thread},
    watchdog::HealthComponent,
};
use self::watchdog::{HealthComponent as Stage, PipelineHealth, spawn_watchdog};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to open frame source: {0}")]
    Open(#[from] CaptureError),
    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Opens the frame source for a run.
pub type SourceFactory =
    Arc<dyn Fn(&CaptureSettings) -> Result<FrameSource, CaptureError> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Inner {
    config: PipelineConfig,
    classifier: ColorClassifier,
    tracker: IdentityTracker,
    renderer: RwLock<Arc<dyn FrameRenderer>>,
    factory: RwLock<SourceFactory>,
    snapshot: Mutex<Arc<PipelineSnapshot>>,
    /// Bumped on every start and stop; a cycle only publishes for the run it
    /// was started by.
    generation: AtomicU64,
    state: Mutex<PipelineState>,
    /// Handles of the current run that status queries may inspect.
    live: Mutex<Option<LiveView>>,
}

#[derive(Clone)]
struct LiveView {
    source: Arc<FrameSource>,
    health: Arc<PipelineHealth>,
}

struct ActiveRun {
    running: Arc<AtomicBool>,
    source: Arc<FrameSource>,
    detection: Option<JoinHandle<()>>,
    detection_done: Receiver<()>,
    watchdog: Option<JoinHandle<()>>,
}

impl Inner {
    fn set_state(&self, state: PipelineState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!(from = ?*current, to = ?state, "pipeline state");
            *current = state;
        }
    }

    fn state(&self) -> PipelineState {
        *lock(&self.state)
    }

    fn renderer(&self) -> Arc<dyn FrameRenderer> {
        match self.renderer.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn factory(&self) -> SourceFactory {
        match self.factory.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn snapshot(&self) -> Arc<PipelineSnapshot> {
        Arc::clone(&lock(&self.snapshot))
    }

    /// Store `snapshot` unless its run has since been stopped or replaced.
    fn publish(&self, generation: u64, snapshot: PipelineSnapshot) -> bool {
        let mut current = lock(&self.snapshot);
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        *current = Arc::new(snapshot);
        true
    }

    /// Open a new run generation. Taken under the snapshot lock so no cycle of
    /// an earlier run can publish afterwards.
    fn next_generation(&self) -> u64 {
        let _snapshot = lock(&self.snapshot);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Detection pipeline over one frame source.
pub struct Pipeline {
    inner: Arc<Inner>,
    lifecycle: Mutex<Option<ActiveRun>>,
}

impl Pipeline {
    /// Pipeline reading from `source`, a device index, path or stream URL.
    pub fn new(config: PipelineConfig, source: impl Into<String>, specs: Vec<ColorSpec>) -> Self {
        let uri = source.into();
        Self::with_source_factory(config, specs, move |settings: &CaptureSettings| {
            FrameSource::open(&uri, settings.clone())
        })
    }

    /// Pipeline whose source is produced by `factory` on every `start()`.
    pub fn with_source_factory<F>(config: PipelineConfig, specs: Vec<ColorSpec>, factory: F) -> Self
    where
        F: Fn(&CaptureSettings) -> Result<FrameSource, CaptureError> + Send + Sync + 'static,
    {
        let classifier = ColorClassifier::new(specs, config.min_area);
        let tracker = IdentityTracker::new(config.tracker.clone());
        let renderer: Arc<dyn FrameRenderer> = Arc::new(PassthroughRenderer);
        let factory: SourceFactory = Arc::new(factory);
        Self {
            inner: Arc::new(Inner {
                config,
                classifier,
                tracker,
                renderer: RwLock::new(renderer),
                factory: RwLock::new(factory),
                generation: AtomicU64::new(0),
                snapshot: Mutex::new(Arc::new(PipelineSnapshot::default())),
                state: Mutex::new(PipelineState::Stopped),
                live: Mutex::new(None),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn tracker(&self) -> &IdentityTracker {
        &self.inner.tracker
    }

    pub fn classifier(&self) -> &ColorClassifier {
        &self.inner.classifier
    }

    /// Install the renderer used from the next cycle on.
    pub fn set_renderer(&self, renderer: Arc<dyn FrameRenderer>) {
        match self.inner.renderer.write() {
            Ok(mut guard) => *guard = renderer,
            Err(poisoned) => *poisoned.into_inner() = renderer,
        }
    }

    /// Point the next `start()` at a different source URI.
    pub fn set_source(&self, source: impl Into<String>) {
        self.set_source_factory(uri_factory(source.into()));
    }

    /// The factory the next `start()` will open its source with.
    pub fn source_factory(&self) -> SourceFactory {
        self.inner.factory()
    }

    pub fn set_source_factory(&self, factory: SourceFactory) {
        match self.inner.factory.write() {
            Ok(mut guard) => *guard = factory,
            Err(poisoned) => *poisoned.into_inner() = factory,
        }
    }

    /// Swap the active colour set; the next cycle uses the new one.
    pub fn set_color_specs(&self, specs: Vec<ColorSpec>) {
        info!(count = specs.len(), "colour set replaced");
        self.inner.classifier.replace_specs(specs);
    }

    pub fn color_specs(&self) -> Arc<[ColorSpec]> {
        self.inner.classifier.specs()
    }

    pub fn state(&self) -> PipelineState {
        self.inner.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// Open the source and launch the detection loop.
    ///
    /// Calling `start()` on a running pipeline is a no-op.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.is_some() {
            return Ok(());
        }
        self.inner.set_state(PipelineState::Starting);

        let factory = self.inner.factory();
        let source = match factory(&self.inner.config.capture) {
            Ok(source) => Arc::new(source),
            Err(err) => {
                error!(error = %err, "frame source failed to open");
                self.inner.set_state(PipelineState::Stopped);
                return Err(PipelineError::Open(err));
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let health = Arc::new(PipelineHealth::new());
        let (done_tx, done_rx) = bounded::<()>(1);
        let generation = self.inner.next_generation();

        self.inner.set_state(PipelineState::Running);
        let detection = {
            let inner = Arc::clone(&self.inner);
            let source = Arc::clone(&source);
            let running = Arc::clone(&running);
            let health = Arc::clone(&health);
            telemetry::spawn_thread("vision-detection", move || {
                let _done = done_tx;
                detection_loop(&inner, generation, &source, &running, &health);
            })
        };
        let detection = match detection {
            Ok(handle) => handle,
            Err(err) => {
                running.store(false, Ordering::Release);
                source.close();
                self.inner.set_state(PipelineState::Stopped);
                return Err(PipelineError::Spawn(err));
            }
        };

        let watchdog = match spawn_watchdog(Arc::clone(&health), Arc::clone(&running)) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(error = %err, "watchdog unavailable; continuing without stall reports");
                None
            }
        };

        *lock(&self.inner.live) = Some(LiveView {
            source: Arc::clone(&source),
            health,
        });
        *lifecycle = Some(ActiveRun {
            running,
            source,
            detection: Some(detection),
            detection_done: done_rx,
            watchdog,
        });
        info!("pipeline running");
        Ok(())
    }

    /// Stop the detection loop and release the source. Idempotent.
    pub fn stop(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        let Some(mut run) = lifecycle.take() else {
            return;
        };
        self.inner.set_state(PipelineState::Stopping);
        run.running.store(false, Ordering::Release);
        self.inner.next_generation();

        let timeout = self.inner.config.stop_timeout;
        match run.detection_done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("detection loop did not exit within {timeout:?}; detaching");
                run.detection.take();
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = run.detection.take() {
                    if handle.join().is_err() {
                        error!("detection thread panicked");
                    }
                }
            }
        }
        if let Some(handle) = run.watchdog.take() {
            let _ = handle.join();
        }

        lock(&self.inner.live).take();
        run.source.close();
        metrics::gauge!("vision_pipeline_fps").set(0.0);
        self.inner.set_state(PipelineState::Stopped);
        info!("pipeline stopped");
    }

    /// The most recently published cycle.
    pub fn latest_snapshot(&self) -> Arc<PipelineSnapshot> {
        self.inner.snapshot()
    }

    pub fn status(&self) -> PipelineStatus {
        let state = self.inner.state();
        let live = lock(&self.inner.live).clone();
        let snapshot = self.inner.snapshot();
        let running = state == PipelineState::Running;
        PipelineStatus {
            state,
            running,
            source_healthy: live.as_ref().is_some_and(|view| view.source.is_healthy()),
            detected: snapshot.detections.len(),
            tracked: snapshot.tracked.len(),
            fps: if running { snapshot.fps } else { 0.0 },
            stalled: live.and_then(|view| view.health.stalled()),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn uri_factory(uri: String) -> SourceFactory {
    Arc::new(move |settings: &CaptureSettings| FrameSource::open(&uri, settings.clone()))
}

fn sleep_while(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

fn detection_loop(
    inner: &Inner,
    generation: u64,
    source: &FrameSource,
    running: &AtomicBool,
    health: &PipelineHealth,
) {
    let interval = inner.config.detection_interval();
    let idle_sleep = inner.config.idle_sleep;
    let mut fps = RollingFps::default();
    let mut last_sequence = 0u64;
    let mut last_cycle: Option<Instant> = None;

    while running.load(Ordering::Acquire) {
        health.beat(Stage::Detection);

        if let Some(last) = last_cycle {
            let since = last.elapsed();
            if since < interval {
                sleep_while(running, interval - since);
                continue;
            }
        }

        let sequence = source.latest_sequence();
        if sequence == last_sequence {
            sleep_while(running, idle_sleep);
            continue;
        }
        let Some(frame) = source.read_latest() else {
            sleep_while(running, idle_sleep);
            continue;
        };
        last_sequence = frame.sequence;
        health.beat(Stage::Capture);

        let started = Instant::now();
        last_cycle = Some(started);
        let current_fps = fps.tick(started);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_cycle(inner, generation, &frame, current_fps)));
        if outcome.is_err() {
            error!(frame = frame.sequence, "detection cycle panicked; continuing");
            metrics::counter!("vision_cycle_panics_total").increment(1);
        }
    }
    debug!("detection loop exited");
}

fn run_cycle(inner: &Inner, generation: u64, frame: &Frame, fps: f64) {
    let span = info_span!(
        "detection.cycle",
        frame = frame.sequence,
        detections = tracing::field::Empty,
        tracked = tracing::field::Empty
    );
    let _guard = span.enter();

    let stage_start = Instant::now();
    let detections = inner.classifier.classify(Some(frame));
    metrics::histogram!("vision_stage_latency_seconds", "stage" => "classify")
        .record(stage_start.elapsed().as_secs_f64());

    let stage_start = Instant::now();
    let boxes: Vec<BoundingBox> = detections.iter().map(|d| d.bbox).collect();
    let tracked: Vec<TrackedBox> = inner
        .tracker
        .update(&boxes)
        .into_iter()
        .map(|(id, bbox)| TrackedBox { id, bbox })
        .collect();
    metrics::histogram!("vision_stage_latency_seconds", "stage" => "track")
        .record(stage_start.elapsed().as_secs_f64());
    span.record("detections", detections.len());
    span.record("tracked", tracked.len());

    let stage_start = Instant::now();
    let renderer = inner.renderer();
    let scene = Scene {
        frame,
        detections: &detections,
        tracked: &tracked,
        tracker: &inner.tracker,
        fps,
    };
    let rendered: Cow<'_, Frame> =
        match panic::catch_unwind(AssertUnwindSafe(|| renderer.render(&scene))) {
            Ok(Ok(drawn)) => Cow::Owned(drawn),
            Ok(Err(err)) => {
                warn!(error = %err, "render failed; publishing undrawn frame");
                metrics::counter!("vision_render_errors_total").increment(1);
                Cow::Borrowed(frame)
            }
            Err(_) => {
                warn!("renderer panicked; publishing undrawn frame");
                metrics::counter!("vision_render_errors_total").increment(1);
                Cow::Borrowed(frame)
            }
        };
    metrics::histogram!("vision_stage_latency_seconds", "stage" => "render")
        .record(stage_start.elapsed().as_secs_f64());

    let stage_start = Instant::now();
    let jpeg = match encode_jpeg(&rendered, inner.config.jpeg_quality) {
        Ok(jpeg) => jpeg,
        Err(err) => {
            warn!(error = %err, "snapshot encode failed; keeping previous image");
            inner.snapshot().jpeg.clone()
        }
    };
    metrics::histogram!("vision_stage_latency_seconds", "stage" => "encode")
        .record(stage_start.elapsed().as_secs_f64());

    let detected = detections.len();
    let published = inner.publish(
        generation,
        PipelineSnapshot {
            jpeg,
            detections,
            tracked,
            fps,
            frame_sequence: frame.sequence,
            timestamp_ms: frame.timestamp_ms,
        },
    );
    if !published {
        debug!(frame = frame.sequence, "discarding cycle from a stopped run");
        return;
    }
    metrics::gauge!("vision_pipeline_fps").set(fps);
    metrics::gauge!("vision_detections").set(detected as f64);
    metrics::gauge!("vision_tracked_objects").set(inner.tracker.len() as f64);
}
