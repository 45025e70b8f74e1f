//! Configuration management
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `OTF_*` environment variables (a `.env` file is honoured), then CLI flags
//! applied by the binary.
//!
//! ```toml
//! [paths]
//! input_dir = "/data/2022-2/KhalifahJun2022"
//! poni_file = "Si_640f_14rings.poni"
//! mask_file = "beamstop_edge_block_mask.tif"
//!
//! [integration]
//! method = "bbox"
//! unit = "2th_deg"
//! radial_points = 15000
//!
//! [schedule]
//! settle_delay_secs = 3
//! cycle_interval_secs = 5
//! ```

use crate::error::{IngestError, Result};
use otf_geometry::{ErrorModel, IntegrationMethod, RadialUnit, RAW_HEADER_LINES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Output subdirectory used when no output directory is configured.
pub const DEFAULT_OUTPUT_SUBDIR: &str = "XY";

/// Calibration subdirectory used when no calibration directory is configured.
pub const DEFAULT_CALIB_SUBDIR: &str = "calib";

pub const DEFAULT_PONI_FILE: &str = "calibration.poni";

pub const DEFAULT_INPUT_EXTENSION: &str = "tif";

pub const DEFAULT_OUTPUT_EXTENSION: &str = "xy";

/// Checkpoint manifest file name, stored in the output directory.
pub const DEFAULT_MANIFEST_FILE: &str = ".otf-manifest.json";

pub const DEFAULT_RADIAL_POINTS: usize = 15000;

/// Pixels below this value (all negative pixels) are excluded.
pub const DEFAULT_DUMMY: f32 = -1e-10;

/// Seconds to wait before opening newly discovered frames.
pub const DEFAULT_SETTLE_DELAY_SECS: u64 = 3;

/// Seconds to sleep between scan cycles.
pub const DEFAULT_CYCLE_INTERVAL_SECS: u64 = 5;

/// Attempts per frame before it is given up for the rest of the run.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Full configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub integration: IntegrationConfig,
    pub schedule: ScheduleConfig,
}

/// Directory layout and file naming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory the acquisition system writes frames into
    pub input_dir: PathBuf,
    /// Defaults to `<input_dir>/XY`
    pub output_dir: Option<PathBuf>,
    /// Defaults to `<input_dir>/calib`
    pub calibration_dir: Option<PathBuf>,
    /// PONI file, relative to the calibration directory
    pub poni_file: PathBuf,
    /// Mask TIFF, relative to the calibration directory
    pub mask_file: Option<PathBuf>,
    pub input_extension: String,
    pub output_extension: String,
    pub manifest_file: String,
}

/// Fixed parameters handed to the integrator for every frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub method: IntegrationMethod,
    pub unit: RadialUnit,
    pub radial_points: usize,
    pub dummy: f32,
    pub error_model: ErrorModel,
    pub correct_solid_angle: bool,
    /// Comment lines to drop from the integrator's raw output
    pub header_lines: usize,
}

/// Timing and failure policy of the ingestion loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub settle_delay_secs: u64,
    pub cycle_interval_secs: u64,
    /// Stop after this many cycles; `None` runs until cancelled
    pub max_cycles: Option<u64>,
    pub max_attempts: u32,
    /// Abort the run on the first failing frame
    pub fail_fast: bool,
    /// Treat frames whose output already validates as processed
    pub skip_existing: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("."),
            output_dir: None,
            calibration_dir: None,
            poni_file: PathBuf::from(DEFAULT_PONI_FILE),
            mask_file: None,
            input_extension: DEFAULT_INPUT_EXTENSION.to_string(),
            output_extension: DEFAULT_OUTPUT_EXTENSION.to_string(),
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
        }
    }
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            method: IntegrationMethod::Bbox,
            unit: RadialUnit::TwoThetaDeg,
            radial_points: DEFAULT_RADIAL_POINTS,
            dummy: DEFAULT_DUMMY,
            error_model: ErrorModel::None,
            correct_solid_angle: false,
            header_lines: RAW_HEADER_LINES,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: DEFAULT_SETTLE_DELAY_SECS,
            cycle_interval_secs: DEFAULT_CYCLE_INTERVAL_SECS,
            max_cycles: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            fail_fast: false,
            skip_existing: true,
        }
    }
}

impl PathsConfig {
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.input_dir.join(DEFAULT_OUTPUT_SUBDIR))
    }

    pub fn calibration_dir(&self) -> PathBuf {
        self.calibration_dir
            .clone()
            .unwrap_or_else(|| self.input_dir.join(DEFAULT_CALIB_SUBDIR))
    }

    pub fn poni_path(&self) -> PathBuf {
        self.calibration_dir().join(&self.poni_file)
    }

    pub fn mask_path(&self) -> Option<PathBuf> {
        self.mask_file.as_ref().map(|m| self.calibration_dir().join(m))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir().join(&self.manifest_file)
    }
}

impl ScheduleConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}

fn env_value<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| IngestError::config(format!("{}='{}': {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let config = config.merge_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            IngestError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| IngestError::config(format!("invalid TOML: {}", e)))
    }

    /// Apply `OTF_*` environment variables on top of this configuration
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(dir) = env_value::<PathBuf>("OTF_INPUT_DIR")? {
            self.paths.input_dir = dir;
        }
        if let Some(dir) = env_value::<PathBuf>("OTF_OUTPUT_DIR")? {
            self.paths.output_dir = Some(dir);
        }
        if let Some(dir) = env_value::<PathBuf>("OTF_CALIB_DIR")? {
            self.paths.calibration_dir = Some(dir);
        }
        if let Some(file) = env_value::<PathBuf>("OTF_PONI_FILE")? {
            self.paths.poni_file = file;
        }
        if let Some(file) = env_value::<PathBuf>("OTF_MASK_FILE")? {
            self.paths.mask_file = Some(file);
        }
        if let Some(ext) = env_value::<String>("OTF_INPUT_EXTENSION")? {
            self.paths.input_extension = ext;
        }
        if let Some(method) = env_value::<IntegrationMethod>("OTF_METHOD")? {
            self.integration.method = method;
        }
        if let Some(unit) = env_value::<RadialUnit>("OTF_UNIT")? {
            self.integration.unit = unit;
        }
        if let Some(points) = env_value::<usize>("OTF_RADIAL_POINTS")? {
            self.integration.radial_points = points;
        }
        if let Some(model) = env_value::<ErrorModel>("OTF_ERROR_MODEL")? {
            self.integration.error_model = model;
        }
        if let Some(secs) = env_value::<u64>("OTF_SETTLE_DELAY_SECS")? {
            self.schedule.settle_delay_secs = secs;
        }
        if let Some(secs) = env_value::<u64>("OTF_CYCLE_INTERVAL_SECS")? {
            self.schedule.cycle_interval_secs = secs;
        }
        if let Some(cycles) = env_value::<u64>("OTF_MAX_CYCLES")? {
            self.schedule.max_cycles = Some(cycles);
        }
        if let Some(fail_fast) = env_value::<bool>("OTF_FAIL_FAST")? {
            self.schedule.fail_fast = fail_fast;
        }
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let paths = &self.paths;

        if paths.input_extension.trim_start_matches('.').is_empty() {
            return Err(IngestError::config("input_extension cannot be empty"));
        }
        if paths.output_extension.trim_start_matches('.').is_empty() {
            return Err(IngestError::config("output_extension cannot be empty"));
        }
        if paths.output_dir() == paths.input_dir
            && paths
                .input_extension
                .trim_start_matches('.')
                .eq_ignore_ascii_case(paths.output_extension.trim_start_matches('.'))
        {
            return Err(IngestError::config(
                "output files would be rediscovered as input: use a different output_dir or extension",
            ));
        }
        if paths.manifest_file.is_empty() {
            return Err(IngestError::config("manifest_file cannot be empty"));
        }

        if self.integration.radial_points == 0 {
            return Err(IngestError::config("radial_points must be greater than 0"));
        }
        if !self.integration.dummy.is_finite() {
            return Err(IngestError::config("dummy must be a finite number"));
        }

        if self.schedule.max_attempts == 0 {
            return Err(IngestError::config("max_attempts must be at least 1"));
        }
        if self.schedule.max_cycles == Some(0) {
            return Err(IngestError::config("max_cycles must be at least 1 when set"));
        }

        Ok(())
    }
}
