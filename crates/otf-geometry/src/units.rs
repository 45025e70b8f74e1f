//! Radial units, integration methods and error models
//!
//! String forms follow the names beamline users already type in their
//! integration settings (`2th_deg`, `q_nm^-1`, ...).

use crate::error::{GeometryError, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Unit of the radial axis of an integrated profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RadialUnit {
    /// Scattering angle 2θ in degrees
    #[default]
    #[serde(rename = "2th_deg")]
    TwoThetaDeg,
    /// Scattering angle 2θ in radians
    #[serde(rename = "2th_rad")]
    TwoThetaRad,
    /// Scattering vector modulus in inverse nanometres
    #[serde(rename = "q_nm^-1")]
    QNm,
    /// Scattering vector modulus in inverse ångström
    #[serde(rename = "q_A^-1")]
    QA,
    /// Radius on the detector plane, in millimetres
    #[serde(rename = "r_mm")]
    RMm,
    /// Squared reciprocal d-spacing in Å⁻²
    #[serde(rename = "d*2_A^-2")]
    DStar2A,
}

impl RadialUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            RadialUnit::TwoThetaDeg => "2th_deg",
            RadialUnit::TwoThetaRad => "2th_rad",
            RadialUnit::QNm => "q_nm^-1",
            RadialUnit::QA => "q_A^-1",
            RadialUnit::RMm => "r_mm",
            RadialUnit::DStar2A => "d*2_A^-2",
        }
    }

    pub fn needs_wavelength(&self) -> bool {
        matches!(self, RadialUnit::QNm | RadialUnit::QA | RadialUnit::DStar2A)
    }

    /// Convert a scattering angle (radians) to this unit
    ///
    /// `distance` is the sample-detector distance in metres and is only used
    /// by [`RadialUnit::RMm`]. `wavelength` is in metres.
    pub fn from_two_theta(&self, tth: f64, distance: f64, wavelength: Option<f64>) -> Result<f64> {
        let q_nm = |wl: f64| 4.0 * PI * (tth / 2.0).sin() / (wl * 1e9);
        let wavelength = || wavelength.ok_or_else(|| GeometryError::MissingWavelength(self.to_string()));

        Ok(match self {
            RadialUnit::TwoThetaDeg => tth.to_degrees(),
            RadialUnit::TwoThetaRad => tth,
            RadialUnit::RMm => distance * tth.tan() * 1e3,
            RadialUnit::QNm => q_nm(wavelength()?),
            RadialUnit::QA => q_nm(wavelength()?) / 10.0,
            RadialUnit::DStar2A => {
                let q_a = q_nm(wavelength()?) / 10.0;
                (q_a / (2.0 * PI)).powi(2)
            },
        })
    }
}

impl std::str::FromStr for RadialUnit {
    type Err = GeometryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "2th_deg" => Ok(RadialUnit::TwoThetaDeg),
            "2th_rad" => Ok(RadialUnit::TwoThetaRad),
            "q_nm^-1" => Ok(RadialUnit::QNm),
            "q_A^-1" => Ok(RadialUnit::QA),
            "r_mm" => Ok(RadialUnit::RMm),
            "d*2_A^-2" => Ok(RadialUnit::DStar2A),
            other => Err(GeometryError::InvalidParameter(format!(
                "unknown radial unit '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RadialUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// How pixel intensity is distributed over radial bins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationMethod {
    /// Each pixel lands entirely in the bin containing its centre
    #[serde(alias = "histogram")]
    No,
    /// Each pixel is spread over the bins covered by its corner extent
    #[default]
    #[serde(alias = "splitpixel")]
    Bbox,
}

impl IntegrationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationMethod::No => "no",
            IntegrationMethod::Bbox => "bbox",
        }
    }
}

impl std::str::FromStr for IntegrationMethod {
    type Err = GeometryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "no" | "histogram" => Ok(IntegrationMethod::No),
            "bbox" | "splitpixel" => Ok(IntegrationMethod::Bbox),
            other => Err(GeometryError::InvalidParameter(format!(
                "unknown integration method '{}' (expected 'no' or 'bbox')",
                other
            ))),
        }
    }
}

impl std::fmt::Display for IntegrationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Uncertainty propagated into the optional sigma column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorModel {
    #[default]
    None,
    /// Variance equals the raw counts
    Poisson,
    /// Variance is the spread of pixel values inside each ring
    Azimuthal,
}

impl ErrorModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorModel::None => "none",
            ErrorModel::Poisson => "poisson",
            ErrorModel::Azimuthal => "azimuthal",
        }
    }

    pub fn has_sigma(&self) -> bool {
        !matches!(self, ErrorModel::None)
    }
}

impl std::str::FromStr for ErrorModel {
    type Err = GeometryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "" => Ok(ErrorModel::None),
            "poisson" => Ok(ErrorModel::Poisson),
            "azimuthal" => Ok(ErrorModel::Azimuthal),
            other => Err(GeometryError::InvalidParameter(format!(
                "unknown error model '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ErrorModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}
