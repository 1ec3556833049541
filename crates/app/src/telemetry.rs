//! Process-wide tracing subscriber and the Prometheus recorder.

use std::{fs::File, path::Path, sync::OnceLock, thread, time::Duration};

use anyhow::{Context, Result, anyhow};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;
use tracing_chrome::{ChromeLayer, ChromeLayerBuilder, FlushGuard, TraceStyle};
use tracing_subscriber::{
    Registry,
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};
use vision::pipeline::spawn_thread;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Keeps the Chrome trace file open until dropped.
pub struct TelemetryGuard {
    _chrome_guard: Option<FlushGuard>,
}

/// Install the global subscriber: env filter (default `info`), uptime-stamped
/// fmt output, span traces for errors and an optional Chrome trace.
pub fn init(chrome_trace: Option<&Path>) -> Result<TelemetryGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome_layer, chrome_guard, chrome_error) = match chrome_trace {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard), None),
            Err(err) => (None, None, Some((path, err))),
        },
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(chrome_layer.map(|layer| layer.with_filter(filter_fn(|metadata| metadata.is_span()))))
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .map_err(|err| anyhow!("tracing subscriber already installed: {err}"))?;

    if let Some((path, err)) = chrome_error {
        warn!(
            "failed to initialise chrome trace writer at {}: {err}",
            path.display()
        );
    }

    Ok(TelemetryGuard {
        _chrome_guard: chrome_guard,
    })
}

fn build_chrome_layer(path: &Path) -> std::io::Result<(ChromeLayer<Registry>, FlushGuard)> {
    let file = File::create(path)?;
    Ok(ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(TraceStyle::Threaded)
        .build())
}

/// Install the global metrics recorder once and return its handle.
pub fn init_metrics_recorder() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|err| anyhow!("metrics recorder already installed: {err}"))?;

    let upkeep = handle.clone();
    spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(Duration::from_secs(5));
            upkeep.run_upkeep();
        }
    })
    .context("failed to spawn prometheus upkeep thread")?;

    Ok(PROM_HANDLE.get_or_init(|| handle))
}

/// The Prometheus handle, when the recorder has been installed.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}
