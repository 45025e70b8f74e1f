//! Collaborators of the ingestion loop
//!
//! The loop only talks to these traits, so tests can drive it with in-memory
//! fakes while the binary wires in the directory scanner, the TIFF reader and
//! the calibrated integrator.

use crate::config::{Config, IntegrationConfig};
use crate::error::Result;
use ndarray::Array2;
use otf_geometry::{image, AzimuthalIntegrator, Integrate1dParams, PoniFile};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Source of candidate frame names
pub trait Scanner {
    /// Return the base names of all candidate frames currently present
    fn scan(&self) -> Result<Vec<String>>;
}

/// Frame decoder
pub trait ImageReader {
    fn read(&self, path: &Path) -> Result<Array2<f32>>;
}

/// What an integration call produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntegrationSummary {
    pub bins: usize,
    pub valid_pixels: usize,
    pub masked_pixels: usize,
}

/// Reduces a frame to a raw column text file
///
/// Geometry, mask and integration parameters are fixed when the integrator is
/// built.
pub trait Integrator {
    fn integrate(&self, image: &Array2<f32>, raw_output: &Path) -> Result<IntegrationSummary>;
}

/// Lists regular files with a given extension in one directory
#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    dir: PathBuf,
    extension: String,
}

impl DirectoryScanner {
    pub fn new(dir: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.paths.input_dir, &config.paths.input_extension)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn matches(&self, name: &str) -> bool {
        !name.starts_with('.')
            && Path::new(name)
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension))
    }
}

impl Scanner for DirectoryScanner {
    fn scan(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!(name = ?raw, "Skipping file with a non UTF-8 name");
                    continue;
                },
            };
            if !self.matches(&name) {
                continue;
            }
            // Follows symlinks
            if !entry.path().is_file() {
                continue;
            }
            names.push(name);
        }

        names.sort();
        Ok(names)
    }
}

/// Reads frames with [`otf_geometry::image::read_tiff`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TiffImageReader;

impl ImageReader for TiffImageReader {
    fn read(&self, path: &Path) -> Result<Array2<f32>> {
        Ok(image::read_tiff(path)?)
    }
}

/// Integrator bound to one PONI calibration and an optional mask
#[derive(Debug, Clone)]
pub struct CalibratedIntegrator {
    integrator: AzimuthalIntegrator,
    mask: Option<Array2<f32>>,
    settings: IntegrationConfig,
}

impl CalibratedIntegrator {
    pub fn new(poni: PoniFile, mask: Option<Array2<f32>>, settings: IntegrationConfig) -> Self {
        Self::with_integrator(AzimuthalIntegrator::new(poni), mask, settings)
    }

    fn with_integrator(
        integrator: AzimuthalIntegrator,
        mask: Option<Array2<f32>>,
        settings: IntegrationConfig,
    ) -> Self {
        Self {
            integrator,
            mask,
            settings,
        }
    }

    /// Load the calibration files named by the configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let poni_path = config.paths.poni_path();
        let integrator = AzimuthalIntegrator::load(&poni_path)?;
        let poni = integrator.poni();
        info!(
            poni = %poni_path.display(),
            detector = %poni.detector,
            distance_m = poni.distance,
            "Loaded calibration"
        );

        let mask = match config.paths.mask_path() {
            Some(mask_path) => {
                let mask = image::read_tiff(&mask_path)?;
                let masked = mask.iter().filter(|&&v| v != 0.0).count();
                info!(
                    mask = %mask_path.display(),
                    rows = mask.nrows(),
                    cols = mask.ncols(),
                    masked,
                    "Loaded mask"
                );
                if let Some(shape) = poni.max_shape {
                    if shape != mask.dim() {
                        warn!(
                            detector_shape = ?shape,
                            mask_shape = ?mask.dim(),
                            "Mask shape differs from the detector shape in the PONI file"
                        );
                    }
                }
                Some(mask)
            },
            None => {
                warn!("No mask configured, every pixel above the dummy value is integrated");
                None
            },
        };

        Ok(Self::with_integrator(integrator, mask, config.integration.clone()))
    }

    pub fn poni(&self) -> &PoniFile {
        self.integrator.poni()
    }

    /// PONI file the calibration was loaded from
    pub fn source(&self) -> Option<&Path> {
        self.integrator.source()
    }

    pub fn mask_shape(&self) -> Option<(usize, usize)> {
        self.mask.as_ref().map(|m| m.dim())
    }

    pub fn settings(&self) -> &IntegrationConfig {
        &self.settings
    }
}

impl Integrator for CalibratedIntegrator {
    fn integrate(&self, image: &Array2<f32>, raw_output: &Path) -> Result<IntegrationSummary> {
        let settings = &self.settings;
        let mut params = Integrate1dParams::new(settings.radial_points)
            .unit(settings.unit)
            .method(settings.method)
            .error_model(settings.error_model)
            .correct_solid_angle(settings.correct_solid_angle)
            .dummy(settings.dummy);
        if let Some(mask) = &self.mask {
            params = params.mask(mask.view());
        }

        let result = self
            .integrator
            .integrate1d(image.view(), &params, Some(raw_output))?;
        debug!(
            bins = result.radial.len(),
            valid = result.valid_pixels,
            masked = result.masked_pixels,
            "Integrated frame"
        );

        Ok(IntegrationSummary {
            bins: result.radial.len(),
            valid_pixels: result.valid_pixels,
            masked_pixels: result.masked_pixels,
        })
    }
}
