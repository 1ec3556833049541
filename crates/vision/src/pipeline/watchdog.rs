//! Watchdog reporting stalled pipeline stages.
//!
//! The detection loop beats `Detection` on every iteration and `Capture`
//! whenever the source delivers a new frame. The watchdog only logs and
//! records the stalled stage; it never restarts anything itself.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tracing::{info, warn};

use crate::pipeline::telemetry;

/// Sleep interval between watchdog health checks.
pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
/// Time without a heartbeat before a component is considered stalled.
pub(crate) const WATCHDOG_STALE_THRESHOLD_MS: u64 = 3_000;
/// Grace period at startup allowing the source to deliver its first frames.
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

const NONE: u8 = 0;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
/// Logical components monitored by the watchdog.
pub enum HealthComponent {
    Capture,
    Detection,
}

impl HealthComponent {
    /// Human readable label used in log messages and metrics.
    pub fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::Detection => "detection",
        }
    }

    fn code(self) -> u8 {
        match self {
            HealthComponent::Capture => 1,
            HealthComponent::Detection => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(HealthComponent::Capture),
            2 => Some(HealthComponent::Detection),
            _ => None,
        }
    }
}

pub(crate) struct PipelineHealth {
    capture: AtomicU64,
    detection: AtomicU64,
    stalled: AtomicU8,
}

impl PipelineHealth {
    /// Initialise the health tracker with a startup grace period.
    pub(crate) fn new() -> Self {
        let grace_deadline = current_millis().saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            capture: AtomicU64::new(grace_deadline),
            detection: AtomicU64::new(grace_deadline),
            stalled: AtomicU8::new(NONE),
        }
    }

    /// Register a heartbeat for the supplied component.
    pub(crate) fn beat(&self, component: HealthComponent) {
        let now = current_millis();
        let slot = match component {
            HealthComponent::Capture => &self.capture,
            HealthComponent::Detection => &self.detection,
        };
        // Never move a beat backwards into the grace window.
        slot.fetch_max(now, Ordering::Relaxed);
    }

    /// Returns the first component that has not produced a heartbeat recently.
    pub(crate) fn stale_component(&self, now: u64) -> Option<HealthComponent> {
        if now.saturating_sub(self.detection.load(Ordering::Relaxed)) > WATCHDOG_STALE_THRESHOLD_MS {
            return Some(HealthComponent::Detection);
        }
        if now.saturating_sub(self.capture.load(Ordering::Relaxed)) > WATCHDOG_STALE_THRESHOLD_MS {
            return Some(HealthComponent::Capture);
        }
        None
    }

    /// Stage the watchdog last reported as stalled.
    pub(crate) fn stalled(&self) -> Option<HealthComponent> {
        HealthComponent::from_code(self.stalled.load(Ordering::Acquire))
    }

    /// Record the latest verdict, returning the previous one.
    fn set_stalled(&self, component: Option<HealthComponent>) -> Option<HealthComponent> {
        let code = component.map_or(NONE, HealthComponent::code);
        HealthComponent::from_code(self.stalled.swap(code, Ordering::AcqRel))
    }

    /// Evaluate health at `now`, logging only when the verdict changes.
    pub(crate) fn check(&self, now: u64) -> Option<HealthComponent> {
        let current = self.stale_component(now);
        let previous = self.set_stalled(current);
        if current != previous {
            match (previous, current) {
                (_, Some(component)) => {
                    warn!(
                        stage = component.label(),
                        "no heartbeat for {} ms; stage stalled", WATCHDOG_STALE_THRESHOLD_MS
                    );
                }
                (Some(component), None) => {
                    info!(stage = component.label(), "stage recovered");
                }
                (None, None) => {}
            }
        }
        current
    }
}

/// Spawn the watchdog thread; it exits once `running` is cleared.
pub(crate) fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("vision-watchdog", move || {
        let poll = Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS);
        let slice = Duration::from_millis(50);
        while running.load(Ordering::Acquire) {
            let mut waited = Duration::ZERO;
            while waited < poll && running.load(Ordering::Acquire) {
                thread::sleep(slice);
                waited += slice;
            }
            if !running.load(Ordering::Acquire) {
                break;
            }
            health.check(current_millis());
        }
        health.set_stalled(None);
    })
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
