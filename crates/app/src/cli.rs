use std::path::PathBuf;

use clap::Parser;

/// Colour-sorting camera service for the factory line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Camera/pipeline settings; created with defaults when missing.
    #[arg(long, default_value = "config/config_camera.json")]
    pub config: PathBuf,

    /// Colour catalogue; created with the built-in colours when missing.
    #[arg(long, default_value = "config/colors.json")]
    pub colors: PathBuf,

    /// Override the configured source (device index, path, rtsp:// or http:// URL).
    #[arg(long)]
    pub source: Option<String>,

    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// JPEG quality of published frames.
    #[arg(long, default_value_t = 80, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub jpeg_quality: u8,

    /// Wait for POST /api/camera/start instead of opening the camera at boot.
    #[arg(long)]
    pub no_autostart: bool,

    /// Write span timings to a Chrome trace file.
    #[arg(long)]
    pub chrome_trace: Option<PathBuf>,
}
