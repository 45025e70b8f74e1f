//! PONI calibration file parsing
//!
//! A PONI file is a list of `Key: value` lines with `#` comments:
//!
//! ```text
//! # Calibration done at Thu Oct 20 10:01:02 2022
//! poni_version: 2
//! Detector: Detector
//! Detector_config: {"pixel1": 0.0002, "pixel2": 0.0002, "max_shape": [2048, 2048]}
//! Distance: 0.987
//! Poni1: 0.2048
//! Poni2: 0.2048
//! Rot1: 0.0012
//! Rot2: -0.0031
//! Rot3: 0.0
//! Wavelength: 1.8233e-11
//! ```
//!
//! Version 1 files carry `PixelSize1`/`PixelSize2` instead of a
//! `Detector_config` object. Keys are matched case-insensitively.

use crate::error::{GeometryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Parsed calibration
///
/// Lengths are metres, angles radians. Axis 1 is the slow (row) axis of the
/// image, axis 2 the fast (column) axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoniFile {
    pub version: u32,
    pub detector: String,
    pub pixel1: f64,
    pub pixel2: f64,
    pub max_shape: Option<(usize, usize)>,
    pub distance: f64,
    pub poni1: f64,
    pub poni2: f64,
    pub rot1: f64,
    pub rot2: f64,
    pub rot3: f64,
    pub wavelength: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct DetectorConfig {
    pixel1: Option<f64>,
    pixel2: Option<f64>,
    max_shape: Option<[usize; 2]>,
}

struct Entries {
    values: HashMap<String, (usize, String)>,
}

impl Entries {
    fn get(&self, key: &str) -> Option<&(usize, String)> {
        self.values.get(key)
    }

    fn number(&self, key: &'static str) -> Result<f64> {
        let (line, raw) = self.get(key).ok_or(GeometryError::MissingKey(key))?;
        parse_number(*line, key, raw)
    }

    fn optional_number(&self, key: &'static str) -> Result<Option<f64>> {
        match self.get(key) {
            Some((_, raw)) if is_null(raw) => Ok(None),
            Some((line, raw)) => parse_number(*line, key, raw).map(Some),
            None => Ok(None),
        }
    }
}

fn is_null(raw: &str) -> bool {
    raw.is_empty() || raw.eq_ignore_ascii_case("none") || raw.eq_ignore_ascii_case("null")
}

fn parse_number(line: usize, key: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>().map_err(|e| GeometryError::Poni {
        line,
        reason: format!("{} is not a number ({}): '{}'", key, e, raw),
    })
}

impl PoniFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let poni = Self::parse(&text)?;
        debug!(path = %path.display(), detector = %poni.detector, "Loaded PONI calibration");
        Ok(poni)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut values = HashMap::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| GeometryError::Poni {
                line: idx + 1,
                reason: format!("expected 'key: value', got '{}'", line),
            })?;
            values.insert(key.trim().to_lowercase(), (idx + 1, value.trim().to_string()));
        }

        let entries = Entries { values };

        let version = match entries.get("poni_version") {
            // "2.1" files exist in the wild, only the major part matters here
            Some((line, raw)) => raw
                .split('.')
                .next()
                .and_then(|major| major.trim().parse::<u32>().ok())
                .ok_or_else(|| GeometryError::Poni {
                    line: *line,
                    reason: format!("invalid poni_version '{}'", raw),
                })?,
            None => 1,
        };

        let detector = entries
            .get("detector")
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| "Detector".to_string());

        let config = match entries.get("detector_config") {
            Some((_, raw)) if !is_null(raw) => serde_json::from_str::<DetectorConfig>(raw)?,
            _ => DetectorConfig::default(),
        };

        if let Some((_, spline)) = entries.get("splinefile") {
            if !is_null(spline) {
                warn!(spline = %spline, "Spline distortion correction is not supported, ignoring");
            }
        }

        let pixel1 = match config.pixel1 {
            Some(p) => Some(p),
            None => entries.optional_number("pixelsize1")?,
        };
        let pixel2 = match config.pixel2 {
            Some(p) => Some(p),
            None => entries.optional_number("pixelsize2")?,
        };
        let (pixel1, pixel2) = match (pixel1, pixel2) {
            (Some(p1), Some(p2)) => (p1, p2),
            _ => return Err(GeometryError::UnsupportedDetector(detector)),
        };

        if pixel1 <= 0.0 || pixel2 <= 0.0 {
            return Err(GeometryError::InvalidParameter(format!(
                "pixel size must be positive, got {} x {}",
                pixel1, pixel2
            )));
        }

        let distance = entries.number("distance")?;
        if distance <= 0.0 {
            return Err(GeometryError::InvalidParameter(format!(
                "sample-detector distance must be positive, got {}",
                distance
            )));
        }

        Ok(Self {
            version,
            detector,
            pixel1,
            pixel2,
            max_shape: config.max_shape.map(|[rows, cols]| (rows, cols)),
            distance,
            poni1: entries.number("poni1")?,
            poni2: entries.number("poni2")?,
            rot1: entries.number("rot1")?,
            rot2: entries.number("rot2")?,
            rot3: entries.number("rot3")?,
            wavelength: entries.optional_number("wavelength")?,
        })
    }
}

impl std::str::FromStr for PoniFile {
    type Err = GeometryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}
