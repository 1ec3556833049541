mod annotation;
mod cli;
mod config;
mod server;
mod service;
mod telemetry;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use crate::{
    cli::Args,
    config::{CameraFile, ColorCatalog},
    service::CameraService,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let _telemetry = telemetry::init(args.chrome_trace.as_deref())?;
    telemetry::init_metrics_recorder()?;

    let camera = CameraFile::load_or_create(&args.config)?;
    let colors = ColorCatalog::load_or_create(&args.colors)?;
    let source = args.source.clone().unwrap_or_else(|| camera.source_uri());
    info!(
        %source,
        width = camera.camera.width,
        height = camera.camera.height,
        colours = colors.specs().len(),
        "configuration loaded"
    );

    let service = Arc::new(CameraService::new(&camera, colors, args.jpeg_quality, source));
    let server = server::spawn_server(Arc::clone(&service), &args.bind, args.port)?;

    if !args.no_autostart {
        if let Err(err) = service.start(None) {
            warn!(error = %format!("{err:#}"), "camera did not start; retry with POST /api/camera/start");
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    service.stop();
    server.stop();
    Ok(())
}
