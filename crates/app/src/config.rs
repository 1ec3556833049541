//! JSON configuration files: camera/pipeline settings and the colour catalogue.
//!
//! Both files are created with defaults when missing so a fresh install comes
//! up without manual setup.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{info, warn};
use video_ingest::CaptureSettings;
use vision::{ColorSpec, PipelineConfig, TrackerConfig};

/// Camera source as written in the file: a device index or any URI/path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceSpec {
    Index(u32),
    Uri(String),
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self::Index(0)
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Uri(uri) => f.write_str(uri),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSection {
    pub src: SourceSpec,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub reconnect_delay_ms: u64,
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            src: SourceSpec::default(),
            width: 640,
            height: 480,
            fps: 30.0,
            reconnect_delay_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSection {
    pub min_contour_area: f64,
    pub max_detection_fps: f64,
}

impl Default for DetectionSection {
    fn default() -> Self {
        Self {
            min_contour_area: 1500.0,
            max_detection_fps: 30.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    /// Seconds an unseen object keeps its identity.
    pub max_lost: f64,
    pub max_history: usize,
    pub match_dist: f64,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            max_lost: 15.0,
            max_history: 20,
            match_dist: 80.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrawingSection {
    pub show_fps: bool,
    /// Seconds of trajectory drawn behind each object.
    pub trajectory_ttl: f64,
    /// Overlay opacity in `0.0..=1.0`.
    pub alpha: f32,
}

impl Default for DrawingSection {
    fn default() -> Self {
        Self {
            show_fps: true,
            trajectory_ttl: 3.0,
            alpha: 0.4,
        }
    }
}

/// Contents of `config_camera.json`. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraFile {
    pub camera: CameraSection,
    pub detection: DetectionSection,
    pub tracker: TrackerSection,
    pub drawing: DrawingSection,
}

impl CameraFile {
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let config: Self = load_or_create_json(path, &Self::default)?;
        config
            .validate()
            .with_context(|| format!("invalid camera configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        ensure!(
            camera.width > 0 && camera.height > 0,
            "camera size must be non-zero, got {}x{}",
            camera.width,
            camera.height
        );
        ensure!(camera.fps > 0.0, "camera fps must be positive");
        ensure!(
            self.detection.max_detection_fps > 0.0,
            "max_detection_fps must be positive"
        );
        ensure!(
            self.detection.min_contour_area >= 0.0,
            "min_contour_area cannot be negative"
        );
        ensure!(self.tracker.max_lost > 0.0, "tracker max_lost must be positive");
        ensure!(self.tracker.match_dist > 0.0, "tracker match_dist must be positive");
        ensure!(self.tracker.max_history > 0, "tracker max_history must be at least 1");
        ensure!(
            (0.0..=1.0).contains(&self.drawing.alpha),
            "drawing alpha must lie in 0.0..=1.0"
        );
        ensure!(
            self.drawing.trajectory_ttl >= 0.0,
            "trajectory_ttl cannot be negative"
        );
        Ok(())
    }

    pub fn source_uri(&self) -> String {
        self.camera.src.to_string()
    }

    pub fn to_pipeline_config(&self, jpeg_quality: u8) -> PipelineConfig {
        PipelineConfig {
            capture: CaptureSettings {
                width: self.camera.width,
                height: self.camera.height,
                target_fps: self.camera.fps,
                reconnect_delay: Duration::from_millis(self.camera.reconnect_delay_ms),
            },
            min_area: self.detection.min_contour_area,
            max_detection_fps: self.detection.max_detection_fps,
            tracker: TrackerConfig {
                max_lost: Duration::from_secs_f64(self.tracker.max_lost),
                match_distance: self.tracker.match_dist,
                trajectory_capacity: self.tracker.max_history,
            },
            jpeg_quality,
            ..PipelineConfig::default()
        }
    }
}

/// One colour as stored in `colors.json`.
///
/// Only `name`, `action_id` and `duration_ms` are honoured on load; the other
/// fields are written for readability and ignored when merging.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<[u8; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<[u8; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bgr: Option<[u8; 3]>,
}

impl From<&ColorSpec> for ColorEntry {
    fn from(spec: &ColorSpec) -> Self {
        Self {
            name: spec.name.clone(),
            action_id: Some(spec.action_id),
            duration_ms: Some(spec.duration_ms),
            lower: Some(spec.lower),
            upper: Some(spec.upper),
            bgr: Some(spec.bgr),
        }
    }
}

fn builtin(
    name: &str,
    bgr: [u8; 3],
    lower: [u8; 3],
    upper: [u8; 3],
    action_id: i32,
    duration_ms: u32,
) -> ColorSpec {
    ColorSpec {
        name: name.to_owned(),
        lower,
        upper,
        bgr,
        action_id,
        duration_ms,
    }
}

/// The seven colours the sorter knows about.
pub fn builtin_colors() -> Vec<ColorSpec> {
    vec![
        builtin("red", [0, 0, 255], [0, 100, 80], [10, 255, 255], 3, 8000),
        builtin("orange", [0, 165, 255], [10, 100, 100], [20, 255, 255], 5, 5000),
        builtin("yellow", [0, 255, 255], [22, 100, 100], [33, 255, 255], 4, 5000),
        builtin("green", [0, 255, 0], [35, 80, 80], [85, 255, 255], 2, 6000),
        builtin("blue", [255, 0, 0], [90, 70, 70], [130, 255, 255], 1, 4000),
        builtin("purple", [255, 0, 255], [135, 60, 60], [155, 255, 255], 6, 6000),
        builtin("pink", [203, 192, 255], [155, 70, 100], [175, 255, 255], 7, 7000),
    ]
}

/// Merge file entries over the built-in catalogue, keeping file order.
pub fn merge_entries(entries: &[ColorEntry]) -> Result<Vec<ColorSpec>> {
    let catalogue = builtin_colors();
    let mut merged = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(base) = catalogue.iter().find(|spec| spec.name == entry.name) else {
            warn!(name = %entry.name, "unknown colour dropped");
            continue;
        };
        if merged.iter().any(|spec: &ColorSpec| spec.name == entry.name) {
            warn!(name = %entry.name, "duplicate colour dropped");
            continue;
        }
        let mut spec = base.clone();
        if let Some(action_id) = entry.action_id {
            spec.action_id = action_id;
        }
        if let Some(duration_ms) = entry.duration_ms {
            spec.duration_ms = duration_ms;
        }
        ensure!(
            spec.is_well_formed(),
            "colour {} has inverted thresholds",
            spec.name
        );
        merged.push(spec);
    }
    Ok(merged)
}

/// The colour file together with its merged, active colour set.
#[derive(Debug)]
pub struct ColorCatalog {
    path: PathBuf,
    specs: Vec<ColorSpec>,
}

impl ColorCatalog {
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let entries: Vec<ColorEntry> = load_or_create_json(path, &|| {
            builtin_colors().iter().map(ColorEntry::from).collect()
        })?;
        let specs = merge_entries(&entries)
            .with_context(|| format!("invalid colour catalogue in {}", path.display()))?;
        info!(path = %path.display(), colours = specs.len(), "colour catalogue loaded");
        Ok(Self {
            path: path.to_path_buf(),
            specs,
        })
    }

    pub fn specs(&self) -> &[ColorSpec] {
        &self.specs
    }

    /// Rewrite the file with `entries` and re-merge. The active set is left
    /// untouched when validation or the write fails.
    pub fn save(&mut self, entries: &[ColorEntry]) -> Result<&[ColorSpec]> {
        let specs = merge_entries(entries)?;
        write_json(&self.path, &entries)?;
        info!(path = %self.path.display(), colours = specs.len(), "colour catalogue saved");
        self.specs = specs;
        Ok(&self.specs)
    }
}

fn load_or_create_json<T>(path: &Path, default: &dyn Fn() -> T) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    if !path.exists() {
        let value = default();
        write_json(path, &value)?;
        info!(path = %path.display(), "wrote default configuration");
        return Ok(value);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value).context("failed to serialise configuration")?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}
