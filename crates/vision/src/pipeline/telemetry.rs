//! Thread and rate helpers shared by the pipeline stages.

use std::{
    collections::VecDeque,
    io, thread,
    time::{Duration, Instant},
};

/// Spawn a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

/// Cycles per second over a sliding window.
#[derive(Debug)]
pub struct RollingFps {
    window: Duration,
    ticks: VecDeque<Instant>,
}

impl RollingFps {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ticks: VecDeque::new(),
        }
    }

    /// Record one processed cycle at `now` and return the current rate.
    pub fn tick(&mut self, now: Instant) -> f64 {
        self.ticks.push_back(now);
        self.rate(now)
    }

    /// Rate as of `now`, dropping samples that fell out of the window.
    pub fn rate(&mut self, now: Instant) -> f64 {
        while let Some(oldest) = self.ticks.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
        if self.window.is_zero() {
            return 0.0;
        }
        self.ticks.len() as f64 / self.window.as_secs_f64()
    }
}

impl Default for RollingFps {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
