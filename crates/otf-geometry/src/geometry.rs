//! Detector geometry
//!
//! The detector is described by the point of normal incidence (PONI) on its
//! plane, the sample-PONI distance and three rotations applied in the order
//! rot1 (about axis 1), rot2 (about axis 2), rot3 (about the beam).
//! Positions on the detector are given in pixel units along the slow
//! (row, axis 1) and fast (column, axis 2) directions; `0.5` is the centre of
//! the first pixel.

use crate::poni::PoniFile;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub distance: f64,
    pub poni1: f64,
    pub poni2: f64,
    pub rot1: f64,
    pub rot2: f64,
    pub rot3: f64,
    pub pixel1: f64,
    pub pixel2: f64,
    pub wavelength: Option<f64>,
}

impl From<&PoniFile> for Geometry {
    fn from(poni: &PoniFile) -> Self {
        Self {
            distance: poni.distance,
            poni1: poni.poni1,
            poni2: poni.poni2,
            rot1: poni.rot1,
            rot2: poni.rot2,
            rot3: poni.rot3,
            pixel1: poni.pixel1,
            pixel2: poni.pixel2,
            wavelength: poni.wavelength,
        }
    }
}

/// Precomputed rotation terms, shared by every pixel of a frame
#[derive(Debug, Clone, Copy)]
pub(crate) struct Rotation {
    c1: f64,
    s1: f64,
    c2: f64,
    s2: f64,
    c3: f64,
    s3: f64,
}

impl Geometry {
    pub(crate) fn rotation(&self) -> Rotation {
        Rotation {
            c1: self.rot1.cos(),
            s1: self.rot1.sin(),
            c2: self.rot2.cos(),
            s2: self.rot2.sin(),
            c3: self.rot3.cos(),
            s3: self.rot3.sin(),
        }
    }

    /// Laboratory coordinates (metres) of a detector position
    ///
    /// `d1`/`d2` are in pixel units. The third component lies along the
    /// incident beam.
    pub fn lab_position(&self, d1: f64, d2: f64) -> [f64; 3] {
        self.lab_position_with(&self.rotation(), d1, d2)
    }

    pub(crate) fn lab_position_with(&self, r: &Rotation, d1: f64, d2: f64) -> [f64; 3] {
        let p1 = d1 * self.pixel1 - self.poni1;
        let p2 = d2 * self.pixel2 - self.poni2;
        let l = self.distance;

        let t1 = p1 * r.c2 * r.c3 + p2 * (r.c3 * r.s1 * r.s2 - r.c1 * r.s3)
            - l * (r.c1 * r.c3 * r.s2 + r.s1 * r.s3);
        let t2 = p1 * r.c2 * r.s3 + p2 * (r.c1 * r.c3 + r.s1 * r.s2 * r.s3)
            - l * (-r.c3 * r.s1 + r.c1 * r.s2 * r.s3);
        let t3 = p1 * r.s2 - p2 * r.c2 * r.s1 + l * r.c1 * r.c2;

        [t1, t2, t3]
    }

    /// Scattering angle 2θ (radians) at a detector position in pixel units
    pub fn two_theta(&self, d1: f64, d2: f64) -> f64 {
        two_theta_of(self.lab_position(d1, d2))
    }

    /// Cosine of the angle between the scattered ray and the detector normal
    pub fn cos_incidence(&self, d1: f64, d2: f64) -> f64 {
        cos_incidence_of(self, self.lab_position(d1, d2))
    }
}

pub(crate) fn two_theta_of([t1, t2, t3]: [f64; 3]) -> f64 {
    (t1 * t1 + t2 * t2).sqrt().atan2(t3)
}

/// The detector normal passes through the PONI, so the incidence cosine is
/// the distance divided by the ray length.
pub(crate) fn cos_incidence_of(geometry: &Geometry, [t1, t2, t3]: [f64; 3]) -> f64 {
    geometry.distance / (t1 * t1 + t2 * t2 + t3 * t3).sqrt()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn flat(distance: f64) -> Geometry {
        Geometry {
            distance,
            poni1: 0.01,
            poni2: 0.01,
            rot1: 0.0,
            rot2: 0.0,
            rot3: 0.0,
            pixel1: 1e-4,
            pixel2: 1e-4,
            wavelength: None,
        }
    }

    #[test]
    fn test_poni_pixel_is_on_the_beam() {
        let g = flat(0.1);
        // PONI at 0.01 m = 100 pixels along both axes
        assert!(g.two_theta(100.0, 100.0).abs() < 1e-12);
        assert!((g.cos_incidence(100.0, 100.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_flat_detector_angle() {
        let g = flat(0.1);
        // 0.01 m off-axis at 0.1 m distance
        let tth = g.two_theta(200.0, 100.0);
        assert!((tth - (0.1f64).atan()).abs() < 1e-12);
        let cos = g.cos_incidence(200.0, 100.0);
        assert!((cos - 0.1 / (0.1f64 * 0.1 + 0.01 * 0.01).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_rot3_does_not_change_two_theta() {
        let mut g = flat(0.2);
        let before = g.two_theta(40.0, 170.0);
        g.rot3 = 0.7;
        let after = g.two_theta(40.0, 170.0);
        assert!((before - after).abs() < 1e-12);
    }

    #[test]
    fn test_tilt_breaks_symmetry() {
        let mut g = flat(0.2);
        g.rot1 = 0.05;
        let left = g.two_theta(100.0, 0.0);
        let right = g.two_theta(100.0, 200.0);
        assert!((left - right).abs() > 1e-6);
    }
}
