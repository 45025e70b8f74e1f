//! OTF Geometry Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Detector geometry and 1D azimuthal integration for area-detector frames.
//!
//! # Overview
//!
//! - **PONI files**: [`poni::PoniFile`] reads the calibration produced by
//!   standard calibration tools (distance, point of normal incidence, three
//!   rotations, pixel size, wavelength)
//! - **Geometry**: [`geometry::Geometry`] maps pixels to scattering angles
//! - **Images**: [`image::read_tiff`] decodes single-channel TIFF frames
//! - **Integration**: [`integrate::AzimuthalIntegrator`] reduces a frame to a
//!   radial profile and can write it as a commented column text file
//!
//! # Example
//!
//! ```no_run
//! use otf_geometry::{image, AzimuthalIntegrator, Integrate1dParams, RadialUnit};
//!
//! fn main() -> otf_geometry::Result<()> {
//!     let ai = AzimuthalIntegrator::load("calib/Si_640f.poni")?;
//!     let frame = image::read_tiff("frame_0001.tif")?;
//!     let params = Integrate1dParams::new(5000).unit(RadialUnit::TwoThetaDeg);
//!     let profile = ai.integrate1d(frame.view(), &params, Some("frame_0001.xy".as_ref()))?;
//!     println!("{} bins", profile.radial.len());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod geometry;
pub mod image;
pub mod integrate;
pub mod poni;
pub mod units;

pub use error::{GeometryError, Result};
pub use geometry::Geometry;
pub use integrate::{AzimuthalIntegrator, Integrate1dParams, Integrate1dResult, RAW_HEADER_LINES};
pub use poni::PoniFile;
pub use units::{ErrorModel, IntegrationMethod, RadialUnit};
