//! Threaded acquisition loop shared by every capture backend.

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use tracing::{debug, info, info_span, warn};

use crate::types::{CaptureError, Frame};

/// Upper bound on how long `close()` waits for the acquisition thread.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// A connected capture handle that yields frames until it fails.
pub trait CaptureSession: Send {
    /// Block until the next frame is available.
    ///
    /// `CaptureError::Decode` drops the frame and keeps the session; any other
    /// error tears the session down and triggers a reconnect.
    fn grab(&mut self) -> Result<Frame, CaptureError>;
}

/// Knows how to (re)open one particular video source.
pub trait Connector: Send + 'static {
    /// Short backend label used for thread names and metric labels.
    fn kind(&self) -> &'static str;

    /// Human readable source description for logs.
    fn describe(&self) -> String;

    fn connect(&mut self) -> Result<Box<dyn CaptureSession>, CaptureError>;

    /// Whether the loop should sleep out the remainder of the frame interval
    /// after each grab. Push-style network streams set their own pace.
    fn paced(&self) -> bool {
        true
    }
}

/// Geometry, rate and retry behaviour requested from a capture source.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub target_fps: f64,
    pub reconnect_delay: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_fps: 30.0,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

impl CaptureSettings {
    pub fn frame_interval(&self) -> Duration {
        if self.target_fps > 0.0 {
            Duration::from_secs_f64(1.0 / self.target_fps)
        } else {
            Duration::ZERO
        }
    }
}

/// Point-in-time counters for a running source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub frames: u64,
    pub reconnects: u64,
    pub decode_errors: u64,
    pub healthy: bool,
}

struct Shared {
    latest: Mutex<Option<Frame>>,
    running: AtomicBool,
    healthy: AtomicBool,
    frames: AtomicU64,
    reconnects: AtomicU64,
    decode_errors: AtomicU64,
}

impl Shared {
    fn latest(&self) -> MutexGuard<'_, Option<Frame>> {
        lock(&self.latest)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Sleep for `total`, waking early once the source is closed.
    fn sleep_while_running(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Owns a video source and keeps the most recent decoded frame available.
pub struct FrameSource {
    shared: Arc<Shared>,
    kind: &'static str,
    description: String,
    worker: Mutex<Option<JoinHandle<()>>>,
    done: Mutex<Option<Receiver<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FrameSource {
    /// Open `uri` with the backend chosen by [`crate::connector_for`].
    pub fn open(uri: &str, settings: CaptureSettings) -> Result<Self, CaptureError> {
        let connector = crate::connector_for(uri, &settings)?;
        Self::with_connector(connector, settings)
    }

    /// Connect once on the calling thread, then hand the session to a
    /// dedicated acquisition thread.
    pub fn with_connector(
        mut connector: Box<dyn Connector>,
        settings: CaptureSettings,
    ) -> Result<Self, CaptureError> {
        let kind = connector.kind();
        let description = connector.describe();
        let session = connector.connect().map_err(|err| match err {
            CaptureError::Open { .. } => err,
            other => CaptureError::Open {
                uri: description.clone(),
                reason: other.to_string(),
            },
        })?;
        info!(kind, source = %description, "capture source opened");

        let shared = Arc::new(Shared {
            latest: Mutex::new(None),
            running: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
            frames: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        });

        let (done_tx, done_rx) = bounded::<()>(1);
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let worker_shared = Arc::clone(&shared);
        let worker_description = description.clone();
        let worker = thread::Builder::new()
            .name(format!("capture-{kind}"))
            .spawn(move || {
                // Dropped when the loop returns or unwinds; `close()` waits on it.
                let _done = done_tx;
                tracing::dispatcher::with_default(&dispatch, || {
                    let span = info_span!("capture", kind, source = %worker_description);
                    let _entered = span.enter();
                    acquisition_loop(connector, Some(session), &worker_shared, &settings);
                });
            })
            .map_err(|err| CaptureError::Other(err.into()))?;

        Ok(Self {
            shared,
            kind,
            description,
            worker: Mutex::new(Some(worker)),
            done: Mutex::new(Some(done_rx)),
        })
    }

    /// Copy of the most recent frame, or `None` if nothing was captured yet.
    pub fn read_latest(&self) -> Option<Frame> {
        self.shared.latest().clone()
    }

    /// Sequence number of the newest frame; zero before the first capture.
    pub fn latest_sequence(&self) -> u64 {
        self.shared.frames.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_running()
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            frames: self.shared.frames.load(Ordering::Acquire),
            reconnects: self.shared.reconnects.load(Ordering::Acquire),
            decode_errors: self.shared.decode_errors.load(Ordering::Acquire),
            healthy: self.is_healthy(),
        }
    }

    /// Stop acquisition and release the device. Safe to call repeatedly.
    pub fn close(&self) {
        self.shared.running.store(false, Ordering::Release);
        let Some(done) = lock(&self.done).take() else {
            return;
        };
        match done.recv_timeout(CLOSE_TIMEOUT) {
            Err(RecvTimeoutError::Timeout) => {
                // The backend is stuck in a blocking read; let it finish on its own.
                warn!(
                    kind = self.kind,
                    source = %self.description,
                    "capture thread did not exit within {:?}; detaching",
                    CLOSE_TIMEOUT
                );
                lock(&self.worker).take();
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(worker) = lock(&self.worker).take() {
                    if worker.join().is_err() {
                        warn!(kind = self.kind, "capture thread panicked");
                    }
                }
            }
        }
        self.shared.healthy.store(false, Ordering::Release);
        info!(kind = self.kind, source = %self.description, "capture source closed");
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn acquisition_loop(
    mut connector: Box<dyn Connector>,
    mut session: Option<Box<dyn CaptureSession>>,
    shared: &Shared,
    settings: &CaptureSettings,
) {
    let kind = connector.kind();
    let paced = connector.paced();
    let frame_interval = settings.frame_interval();

    while shared.is_running() {
        let Some(active) = session.as_mut() else {
            match connector.connect() {
                Ok(reopened) => {
                    session = Some(reopened);
                    shared.healthy.store(true, Ordering::Release);
                    shared.reconnects.fetch_add(1, Ordering::AcqRel);
                    metrics::counter!("capture_reconnects_total", "kind" => kind).increment(1);
                    info!("capture source reconnected");
                }
                Err(err) => {
                    warn!(error = %err, "reconnect failed; retrying in {:?}", settings.reconnect_delay);
                    shared.sleep_while_running(settings.reconnect_delay);
                }
            }
            continue;
        };

        let started = Instant::now();
        match active.grab() {
            Ok(mut frame) => {
                let sequence = shared.frames.load(Ordering::Acquire) + 1;
                frame.sequence = sequence;
                *shared.latest() = Some(frame);
                // Published after the slot so readers never see a sequence ahead of the frame.
                shared.frames.store(sequence, Ordering::Release);
                shared.healthy.store(true, Ordering::Release);
                metrics::counter!("capture_frames_total", "kind" => kind).increment(1);
            }
            Err(CaptureError::Decode(reason)) => {
                debug!(%reason, "dropping undecodable frame");
                shared.decode_errors.fetch_add(1, Ordering::AcqRel);
                metrics::counter!("capture_decode_errors_total", "kind" => kind).increment(1);
            }
            Err(err) => {
                warn!(error = %err, "frame grab failed; reconnecting in {:?}", settings.reconnect_delay);
                shared.healthy.store(false, Ordering::Release);
                session = None;
                shared.sleep_while_running(settings.reconnect_delay);
                continue;
            }
        }

        if paced {
            if let Some(remaining) = frame_interval.checked_sub(started.elapsed()) {
                shared.sleep_while_running(remaining);
            }
        }
    }

    shared.healthy.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use super::*;

    /// Scripted session: replays grab outcomes, then keeps yielding frames.
    struct ScriptedSession {
        script: VecDeque<Result<Frame, CaptureError>>,
    }

    impl CaptureSession for ScriptedSession {
        fn grab(&mut self) -> Result<Frame, CaptureError> {
            self.script
                .pop_front()
                .unwrap_or_else(|| Ok(Frame::filled(4, 4, [0, 0, 255])))
        }
    }

    struct ScriptedConnector {
        connects: Arc<Mutex<u32>>,
        fail_first_open: bool,
        first_script: Option<VecDeque<Result<Frame, CaptureError>>>,
    }

    impl Connector for ScriptedConnector {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        fn describe(&self) -> String {
            "scripted://test".into()
        }

        fn connect(&mut self) -> Result<Box<dyn CaptureSession>, CaptureError> {
            let mut connects = self.connects.lock().unwrap();
            *connects += 1;
            if self.fail_first_open && *connects == 1 {
                return Err(CaptureError::open("scripted://test", "no such device"));
            }
            let script = self.first_script.take().unwrap_or_default();
            Ok(Box::new(ScriptedSession { script }))
        }
    }

    fn fast_settings() -> CaptureSettings {
        CaptureSettings {
            width: 4,
            height: 4,
            target_fps: 200.0,
            reconnect_delay: Duration::from_millis(20),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn open_failure_is_reported_synchronously() {
        let connector = ScriptedConnector {
            connects: Arc::default(),
            fail_first_open: true,
            first_script: None,
        };
        let err = FrameSource::with_connector(Box::new(connector), fast_settings())
            .err()
            .expect("open should fail");
        assert!(err.is_open_error());
    }

    #[test]
    fn read_failure_reconnects_and_keeps_serving_frames() {
        let connects = Arc::new(Mutex::new(0));
        let script = VecDeque::from([
            Ok(Frame::filled(4, 4, [1, 1, 1])),
            Err(CaptureError::Read("cable pulled".into())),
        ]);
        let connector = ScriptedConnector {
            connects: Arc::clone(&connects),
            fail_first_open: false,
            first_script: Some(script),
        };
        let source = FrameSource::with_connector(Box::new(connector), fast_settings()).unwrap();

        assert!(wait_until(|| source.stats().reconnects >= 1));
        assert!(wait_until(|| source.latest_sequence() >= 3));
        assert!(source.is_healthy());
        assert!(*connects.lock().unwrap() >= 2);

        let frame = source.read_latest().expect("frame after reconnect");
        assert!(frame.sequence >= 2);
        source.close();
        assert!(!source.is_healthy());
    }

    #[test]
    fn decode_errors_drop_the_frame_only() {
        let script = VecDeque::from([
            Err(CaptureError::Decode("truncated jpeg".into())),
            Err(CaptureError::Decode("bad huffman table".into())),
        ]);
        let connector = ScriptedConnector {
            connects: Arc::default(),
            fail_first_open: false,
            first_script: Some(script),
        };
        let source = FrameSource::with_connector(Box::new(connector), fast_settings()).unwrap();

        assert!(wait_until(|| source.latest_sequence() >= 1));
        let stats = source.stats();
        assert_eq!(stats.decode_errors, 2);
        assert_eq!(stats.reconnects, 0);
        assert!(source.is_healthy());
    }

    #[test]
    fn read_latest_returns_independent_copies() {
        let connector = ScriptedConnector {
            connects: Arc::default(),
            fail_first_open: false,
            first_script: None,
        };
        let source = FrameSource::with_connector(Box::new(connector), fast_settings()).unwrap();
        assert!(wait_until(|| source.read_latest().is_some()));

        let mut copy = source.read_latest().unwrap();
        copy.data.fill(7);
        let fresh = source.read_latest().unwrap();
        assert_eq!(fresh.pixel(0, 0), Some([0, 0, 255]));
    }

    #[test]
    fn close_is_idempotent() {
        let connector = ScriptedConnector {
            connects: Arc::default(),
            fail_first_open: false,
            first_script: None,
        };
        let source = FrameSource::with_connector(Box::new(connector), fast_settings()).unwrap();
        source.close();
        source.close();
        assert!(!source.is_open());
    }
}
