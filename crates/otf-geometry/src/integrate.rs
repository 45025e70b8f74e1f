//! 1D azimuthal integration
//!
//! Reduces a detector frame to intensity versus a radial coordinate by
//! averaging all valid pixels that fall into equal-width radial bins.

use crate::error::{GeometryError, Result};
use crate::geometry::{cos_incidence_of, two_theta_of, Geometry};
use crate::poni::PoniFile;
use crate::units::{ErrorModel, IntegrationMethod, RadialUnit};
use ndarray::{Array2, ArrayView2};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Number of `#` lines preceding the data rows in a written profile
pub const RAW_HEADER_LINES: usize = 23;

/// Parameters of one integration call
#[derive(Debug, Clone)]
pub struct Integrate1dParams<'a> {
    pub npt: usize,
    pub unit: RadialUnit,
    pub method: IntegrationMethod,
    pub error_model: ErrorModel,
    pub correct_solid_angle: bool,
    /// Pixels with an intensity below this value are ignored
    pub dummy: Option<f32>,
    /// Non-zero entries mark pixels to ignore
    pub mask: Option<ArrayView2<'a, f32>>,
}

impl<'a> Integrate1dParams<'a> {
    pub fn new(npt: usize) -> Self {
        Self {
            npt,
            unit: RadialUnit::default(),
            method: IntegrationMethod::default(),
            error_model: ErrorModel::default(),
            correct_solid_angle: true,
            dummy: None,
            mask: None,
        }
    }

    pub fn unit(mut self, unit: RadialUnit) -> Self {
        self.unit = unit;
        self
    }

    pub fn method(mut self, method: IntegrationMethod) -> Self {
        self.method = method;
        self
    }

    pub fn error_model(mut self, error_model: ErrorModel) -> Self {
        self.error_model = error_model;
        self
    }

    pub fn correct_solid_angle(mut self, correct: bool) -> Self {
        self.correct_solid_angle = correct;
        self
    }

    pub fn dummy(mut self, dummy: f32) -> Self {
        self.dummy = Some(dummy);
        self
    }

    pub fn mask(mut self, mask: ArrayView2<'a, f32>) -> Self {
        self.mask = Some(mask);
        self
    }
}

/// Integrated profile
#[derive(Debug, Clone, PartialEq)]
pub struct Integrate1dResult {
    /// Bin centres in `unit`
    pub radial: Vec<f64>,
    pub intensity: Vec<f64>,
    pub sigma: Option<Vec<f64>>,
    pub unit: RadialUnit,
    pub valid_pixels: usize,
    pub masked_pixels: usize,
}

/// Integrator bound to one calibration
///
/// The per-pixel radial map of the last frame shape is kept, so a run of
/// same-sized frames computes the geometry only once.
pub struct AzimuthalIntegrator {
    poni: PoniFile,
    geometry: Geometry,
    source: Option<PathBuf>,
    map_cache: Mutex<Option<Arc<CachedMap>>>,
}

impl Clone for AzimuthalIntegrator {
    fn clone(&self) -> Self {
        Self {
            poni: self.poni.clone(),
            geometry: self.geometry,
            source: self.source.clone(),
            map_cache: Mutex::new(self.cached_map()),
        }
    }
}

impl std::fmt::Debug for AzimuthalIntegrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzimuthalIntegrator")
            .field("poni", &self.poni)
            .field("source", &self.source)
            .field("cached_shape", &self.cached_map().map(|c| c.key.shape))
            .finish()
    }
}

#[derive(Default, Clone, Copy)]
struct Bin {
    signal: f64,
    norm: f64,
    count: f64,
    square: f64,
    variance: f64,
}

/// Everything a [`RadialMap`] depends on besides the geometry
#[derive(Debug, Clone, Copy, PartialEq)]
struct MapKey {
    shape: (usize, usize),
    unit: RadialUnit,
    method: IntegrationMethod,
    correct_solid_angle: bool,
}

impl MapKey {
    fn new(shape: (usize, usize), params: &Integrate1dParams<'_>) -> Self {
        Self {
            shape,
            unit: params.unit,
            method: params.method,
            correct_solid_angle: params.correct_solid_angle,
        }
    }
}

struct CachedMap {
    key: MapKey,
    map: RadialMap,
}

/// Per-pixel radial coordinates for one frame shape
struct RadialMap {
    centers: Array2<f64>,
    /// `(rows + 1) x (cols + 1)` corner coordinates, only for pixel splitting
    corners: Option<Array2<f64>>,
    /// cos³ of the incidence angle, only with solid-angle correction
    solid_angle: Option<Array2<f64>>,
}

impl RadialMap {
    fn extent(&self, i: usize, j: usize) -> (f64, f64) {
        match &self.corners {
            Some(c) => {
                let values = [c[[i, j]], c[[i + 1, j]], c[[i, j + 1]], c[[i + 1, j + 1]]];
                let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
                let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                (lo, hi)
            },
            None => {
                let r = self.centers[[i, j]];
                (r, r)
            },
        }
    }
}

impl AzimuthalIntegrator {
    pub fn new(poni: PoniFile) -> Self {
        let geometry = Geometry::from(&poni);
        Self {
            poni,
            geometry,
            source: None,
            map_cache: Mutex::new(None),
        }
    }

    /// Load the calibration from a PONI file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut integrator = Self::new(PoniFile::load(path)?);
        integrator.source = Some(path.to_path_buf());
        Ok(integrator)
    }

    pub fn poni(&self) -> &PoniFile {
        &self.poni
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// PONI file this integrator was loaded from
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    fn cached_map(&self) -> Option<Arc<CachedMap>> {
        // The cached value stays usable after a poisoning panic
        match self.map_cache.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Radial map for `shape`, rebuilt only when the shape or parameters change
    fn radial_map_for(
        &self,
        shape: (usize, usize),
        params: &Integrate1dParams<'_>,
    ) -> Result<Arc<CachedMap>> {
        let key = MapKey::new(shape, params);
        if let Some(cached) = self.cached_map().filter(|c| c.key == key) {
            return Ok(cached);
        }

        debug!(rows = shape.0, cols = shape.1, "Computing radial map");
        let cached = Arc::new(CachedMap {
            key,
            map: self.radial_map(shape, params)?,
        });
        match self.map_cache.lock() {
            Ok(mut guard) => *guard = Some(Arc::clone(&cached)),
            Err(poisoned) => *poisoned.into_inner() = Some(Arc::clone(&cached)),
        }
        Ok(cached)
    }

    fn radial_map(&self, shape: (usize, usize), params: &Integrate1dParams<'_>) -> Result<RadialMap> {
        let (rows, cols) = shape;
        let g = &self.geometry;
        let rotation = g.rotation();
        let unit = params.unit;
        let radial = |d1: f64, d2: f64| -> Result<f64> {
            let position = g.lab_position_with(&rotation, d1, d2);
            unit.from_two_theta(two_theta_of(position), g.distance, g.wavelength)
        };

        let mut centers = Array2::<f64>::zeros(shape);
        let mut solid_angle = params
            .correct_solid_angle
            .then(|| Array2::<f64>::zeros(shape));

        for i in 0..rows {
            for j in 0..cols {
                let (d1, d2) = (i as f64 + 0.5, j as f64 + 0.5);
                centers[[i, j]] = radial(d1, d2)?;
                if let Some(sa) = solid_angle.as_mut() {
                    let cos = cos_incidence_of(g, g.lab_position_with(&rotation, d1, d2));
                    sa[[i, j]] = cos * cos * cos;
                }
            }
        }

        let corners = match params.method {
            IntegrationMethod::No => None,
            IntegrationMethod::Bbox => {
                let mut corners = Array2::<f64>::zeros((rows + 1, cols + 1));
                for i in 0..=rows {
                    for j in 0..=cols {
                        corners[[i, j]] = radial(i as f64, j as f64)?;
                    }
                }
                Some(corners)
            },
        };

        Ok(RadialMap {
            centers,
            corners,
            solid_angle,
        })
    }

    /// Integrate a frame into `params.npt` radial bins
    ///
    /// When `filename` is given the profile is also written there as a text
    /// file with [`RAW_HEADER_LINES`] comment lines followed by
    /// whitespace-separated columns.
    pub fn integrate1d(
        &self,
        data: ArrayView2<'_, f32>,
        params: &Integrate1dParams<'_>,
        filename: Option<&Path>,
    ) -> Result<Integrate1dResult> {
        let npt = params.npt;
        if npt == 0 {
            return Err(GeometryError::InvalidParameter("npt must be at least 1".to_string()));
        }
        if let Some(mask) = &params.mask {
            if mask.dim() != data.dim() {
                return Err(GeometryError::ShapeMismatch {
                    what: "mask",
                    image: data.dim(),
                    other: mask.dim(),
                });
            }
        }
        if params.unit.needs_wavelength() && self.geometry.wavelength.is_none() {
            return Err(GeometryError::MissingWavelength(params.unit.to_string()));
        }

        let cached = self.radial_map_for(data.dim(), params)?;
        let map = &cached.map;

        let is_valid = |i: usize, j: usize, value: f32| -> bool {
            if value.is_nan() {
                return false;
            }
            if let Some(mask) = &params.mask {
                if mask[[i, j]] != 0.0 {
                    return false;
                }
            }
            !matches!(params.dummy, Some(dummy) if value < dummy)
        };

        let mut lo_min = f64::INFINITY;
        let mut hi_max = f64::NEG_INFINITY;
        let mut valid_pixels = 0usize;
        for ((i, j), &value) in data.indexed_iter() {
            if !is_valid(i, j, value) {
                continue;
            }
            let (lo, hi) = map.extent(i, j);
            lo_min = lo_min.min(lo);
            hi_max = hi_max.max(hi);
            valid_pixels += 1;
        }
        if valid_pixels == 0 {
            return Err(GeometryError::NoValidPixels);
        }
        let masked_pixels = data.len() - valid_pixels;

        let width = (hi_max - lo_min).max(1e-12) / npt as f64;
        let top = npt as f64;
        let mut bins = vec![Bin::default(); npt];

        for ((i, j), &value) in data.indexed_iter() {
            if !is_valid(i, j, value) {
                continue;
            }
            let value = value as f64;
            let norm = map.solid_angle.as_ref().map_or(1.0, |sa| sa[[i, j]]);
            let mut deposit = |bin: usize, fraction: f64| {
                let b = &mut bins[bin.min(npt - 1)];
                b.signal += fraction * value;
                b.norm += fraction * norm;
                b.count += fraction;
                b.square += fraction * value * value / norm;
                b.variance += fraction * fraction * value.max(0.0);
            };

            let (lo, hi) = map.extent(i, j);
            let a = ((lo - lo_min) / width).clamp(0.0, top);
            let b = ((hi - lo_min) / width).clamp(0.0, top);
            if b - a < 1e-9 {
                deposit(a.floor() as usize, 1.0);
                continue;
            }
            let span = b - a;
            let first = a.floor() as usize;
            let last = (b.ceil() as usize).clamp(first + 1, npt);
            for bin in first..last {
                let overlap = b.min(bin as f64 + 1.0) - a.max(bin as f64);
                if overlap > 0.0 {
                    deposit(bin, overlap / span);
                }
            }
        }

        let radial = (0..npt)
            .map(|k| lo_min + (k as f64 + 0.5) * width)
            .collect::<Vec<_>>();
        let intensity = bins
            .iter()
            .map(|b| if b.norm > 0.0 { b.signal / b.norm } else { 0.0 })
            .collect::<Vec<_>>();
        let sigma = match params.error_model {
            ErrorModel::None => None,
            ErrorModel::Poisson => Some(
                bins.iter()
                    .map(|b| if b.norm > 0.0 { b.variance.sqrt() / b.norm } else { 0.0 })
                    .collect(),
            ),
            ErrorModel::Azimuthal => Some(
                bins.iter()
                    .zip(&intensity)
                    .map(|(b, &mean)| {
                        if b.norm > 0.0 && b.count > 0.0 {
                            let variance = (b.square / b.norm - mean * mean).max(0.0);
                            (variance / b.count).sqrt()
                        } else {
                            0.0
                        }
                    })
                    .collect(),
            ),
        };

        let result = Integrate1dResult {
            radial,
            intensity,
            sigma,
            unit: params.unit,
            valid_pixels,
            masked_pixels,
        };

        debug!(
            npt,
            unit = %params.unit,
            method = %params.method,
            valid_pixels,
            masked_pixels,
            "Integrated frame"
        );

        if let Some(path) = filename {
            self.write_profile(path, &result, params, data.dim(), (lo_min, hi_max))?;
        }

        Ok(result)
    }

    fn header(
        &self,
        path: &Path,
        result: &Integrate1dResult,
        params: &Integrate1dParams<'_>,
        shape: (usize, usize),
        range: (f64, f64),
    ) -> Vec<String> {
        let g = &self.geometry;
        let source = self
            .source
            .as_ref()
            .map_or_else(|| "<in-memory>".to_string(), |p| p.display().to_string());
        let wavelength = g
            .wavelength
            .map_or_else(|| "unset".to_string(), |w| format!("{:e} m", w));
        let dummy = params
            .dummy
            .map_or_else(|| "none".to_string(), |d| d.to_string());
        let sigma_column = if result.sigma.is_some() { format!(" {:>18}", "sigma") } else { String::new() };

        vec![
            "# == Azimuthal integration ==".to_string(),
            format!("# Generated: {}", chrono::Utc::now().to_rfc3339()),
            format!("# Calibration: {}", source),
            format!("# Detector: {}", self.poni.detector),
            format!("# Pixel size: {:e} x {:e} m", g.pixel1, g.pixel2),
            format!("# Distance sample to detector: {} m", g.distance),
            format!("# PONI: {:e}, {:e} m", g.poni1, g.poni2),
            format!("# Rotations: {} {} {} rad", g.rot1, g.rot2, g.rot3),
            format!("# Wavelength: {}", wavelength),
            "# == Integration parameters ==".to_string(),
            format!("# Image shape: {} x {}", shape.0, shape.1),
            format!("# Method: {}", params.method),
            format!("# Radial unit: {}", params.unit),
            format!("# Radial points: {}", params.npt),
            format!("# Radial range: {} .. {}", range.0, range.1),
            format!("# Error model: {}", params.error_model),
            format!("# Solid angle correction: {}", params.correct_solid_angle),
            format!("# Mask applied: {}", params.mask.is_some()),
            format!("# Dummy value: {}", dummy),
            format!("# Valid pixels: {}", result.valid_pixels),
            format!("# Masked pixels: {}", result.masked_pixels),
            format!("# Output: {}", path.display()),
            format!("# {:>16} {:>18}{}", params.unit, "I", sigma_column),
        ]
    }

    fn write_profile(
        &self,
        path: &Path,
        result: &Integrate1dResult,
        params: &Integrate1dParams<'_>,
        shape: (usize, usize),
        range: (f64, f64),
    ) -> Result<()> {
        let header = self.header(path, result, params, shape, range);
        debug_assert_eq!(header.len(), RAW_HEADER_LINES);

        let mut out = BufWriter::new(File::create(path)?);
        for line in &header {
            writeln!(out, "{}", line)?;
        }
        for (k, (r, i)) in result.radial.iter().zip(&result.intensity).enumerate() {
            match &result.sigma {
                Some(sigma) => writeln!(out, "{:>18.10e} {:>18.10e} {:>18.10e}", r, i, sigma[k])?,
                None => writeln!(out, "{:>18.10e} {:>18.10e}", r, i)?,
            }
        }
        out.flush()?;
        Ok(())
    }
}
