//! The observational record of one object.
//!
//! A `Dataset` is shared read-only by every configuration. Its point order is
//! the ingestion order and is also the order of residual vectors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::ParamVector;
use crate::error::{HarnessError, Result};

/// Metres per parsec.
pub const PARSEC_M: f64 = 3.085_677_581_491_367e16;

/// A value with its 1σ uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct Measurement {
    pub value: f64,
    pub error: f64,
}

impl From<(f64, f64)> for Measurement {
    fn from((value, error): (f64, f64)) -> Self {
        Self { value, error }
    }
}

impl From<Measurement> for (f64, f64) {
    fn from(m: Measurement) -> Self {
        (m.value, m.error)
    }
}

/// Where an observed point came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PointSource {
    Spectrum { instrument: String },
    Photometry { filter: String },
}

impl PointSource {
    /// Instrument or filter name.
    pub fn label(&self) -> &str {
        match self {
            PointSource::Spectrum { instrument } => instrument,
            PointSource::Photometry { filter } => filter,
        }
    }
}

/// One observed flux density.
///
/// Units: wavelength in µm, flux and error in W m⁻² µm⁻¹.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedPoint {
    pub source: PointSource,
    pub wavelength: f64,
    pub flux: f64,
    pub error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub object_name: String,
    /// Parallax in milliarcseconds.
    pub parallax: Measurement,
    pub points: Vec<ObservedPoint>,
    /// Spectral resolution per spectrum instrument.
    #[serde(default)]
    pub resolutions: BTreeMap<String, f64>,
}

impl Dataset {
    pub fn new(object_name: impl Into<String>, parallax: Measurement) -> Self {
        Self {
            object_name: object_name.into(),
            parallax,
            points: Vec::new(),
            resolutions: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn wavelengths(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.wavelength).collect()
    }

    pub fn distance_pc(&self) -> f64 {
        1000.0 / self.parallax.value
    }

    pub fn distance_m(&self) -> f64 {
        self.distance_pc() * PARSEC_M
    }

    /// Distinct spectrum instruments, in first-seen order.
    pub fn instruments(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for p in &self.points {
            if let PointSource::Spectrum { instrument } = &p.source {
                if !out.contains(&instrument.as_str()) {
                    out.push(instrument);
                }
            }
        }
        out
    }

    /// Check physical sanity of the record.
    pub fn validate(&self) -> Result<()> {
        if !(self.parallax.value.is_finite() && self.parallax.value > 0.0) {
            return Err(HarnessError::Dataset(format!(
                "parallax must be positive, got {}",
                self.parallax.value
            )));
        }
        for (idx, p) in self.points.iter().enumerate() {
            if !(p.wavelength.is_finite() && p.wavelength > 0.0) {
                return Err(HarnessError::Dataset(format!(
                    "point {idx} ({}): wavelength must be positive",
                    p.source.label()
                )));
            }
            if !p.flux.is_finite() {
                return Err(HarnessError::Dataset(format!(
                    "point {idx} ({}): flux is not finite",
                    p.source.label()
                )));
            }
            if !(p.error.is_finite() && p.error > 0.0) {
                return Err(HarnessError::Dataset(format!(
                    "point {idx} ({}): error must be positive",
                    p.source.label()
                )));
            }
        }
        Ok(())
    }

    /// Apply per-instrument flux scaling from a parameter vector.
    ///
    /// A parameter named `scaling_<instrument>` multiplies the flux and error of
    /// that instrument's spectrum. Photometry is never rescaled.
    pub fn with_calibration(&self, params: &ParamVector) -> Dataset {
        let mut out = self.clone();
        for p in &mut out.points {
            if let PointSource::Spectrum { instrument } = &p.source {
                if let Some(&scale) = params.get(&format!("scaling_{instrument}")) {
                    p.flux *= scale;
                    p.error *= scale;
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(source: PointSource, wavelength: f64, flux: f64) -> ObservedPoint {
        ObservedPoint {
            source,
            wavelength,
            flux,
            error: 0.1,
        }
    }

    #[test]
    fn calibration_scales_only_matching_spectrum() {
        let mut ds = Dataset::new("HD 72946 B", Measurement::from((38.9809, 0.0412)));
        ds.points.push(point(
            PointSource::Spectrum {
                instrument: "SPHERE".to_string(),
            },
            1.1,
            2.0,
        ));
        ds.points.push(point(
            PointSource::Photometry {
                filter: "Paranal/SPHERE.IRDIS_D_H23_2".to_string(),
            },
            1.59,
            3.0,
        ));

        let mut params = ParamVector::new();
        params.insert("scaling_SPHERE".to_string(), 1.5);
        let scaled = ds.with_calibration(&params);

        assert_eq!(scaled.points[0].flux, 3.0);
        assert!((scaled.points[0].error - 0.15).abs() < 1e-12);
        assert_eq!(scaled.points[1].flux, 3.0);
    }

    #[test]
    fn validate_rejects_non_positive_parallax() {
        let ds = Dataset::new("x", Measurement::from((0.0, 0.1)));
        assert!(matches!(ds.validate(), Err(HarnessError::Dataset(_))));
    }

    #[test]
    fn distance_follows_parallax() {
        let ds = Dataset::new("x", Measurement::from((100.0, 0.1)));
        assert!((ds.distance_pc() - 10.0).abs() < 1e-12);
    }
}
