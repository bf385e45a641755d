//! Observed-minus-model residuals at the best fit.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::domain::{Dataset, ParamVector, PointSource};
use crate::engine::{ForwardModel, checked_spectrum};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointResidual {
    /// Position in the dataset.
    pub index: usize,
    pub source: PointSource,
    pub wavelength: f64,
    /// Calibrated observed flux.
    pub observed: f64,
    /// Calibrated 1σ error.
    pub error: f64,
    pub model: f64,
    /// `observed - model`.
    pub residual: f64,
    /// `residual / error`.
    pub normalized: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Residuals {
    /// One entry per dataset point, in dataset order.
    pub points: Vec<PointResidual>,
    pub chi_squared: f64,
    /// `χ² / (n - k)` when there are more points than fitted parameters.
    pub reduced_chi_squared: Option<f64>,
}

/// Compute residuals for every dataset point.
///
/// `scaling_<instrument>` entries in `params` rescale that instrument's spectrum
/// before the comparison, exactly as during sampling.
pub fn compute_residuals(
    dataset: &Dataset,
    params: &ParamVector,
    model: &dyn ForwardModel,
) -> Result<Residuals> {
    let calibrated = dataset.with_calibration(params);
    let flux = checked_spectrum(model, params, &calibrated.wavelengths())?;

    let mut points = Vec::with_capacity(calibrated.len());
    let mut chi_squared = 0.0;
    for (index, (p, &m)) in calibrated.points.iter().zip(&flux).enumerate() {
        let residual = p.flux - m;
        let normalized = residual / p.error;
        chi_squared += normalized * normalized;
        points.push(PointResidual {
            index,
            source: p.source.clone(),
            wavelength: p.wavelength,
            observed: p.flux,
            error: p.error,
            model: m,
            residual,
            normalized,
        });
    }

    let dof = points.len() as isize - params.len() as isize;
    Ok(Residuals {
        points,
        chi_squared,
        reduced_chi_squared: (dof > 0).then(|| chi_squared / dof as f64),
    })
}

/// The `top_n` points with the largest |normalized residual|.
pub fn largest_deviations(residuals: &Residuals, top_n: usize) -> Vec<PointResidual> {
    let mut sorted = residuals.points.clone();
    sorted.sort_by(|a, b| {
        b.normalized
            .abs()
            .partial_cmp(&a.normalized.abs())
            .unwrap_or(Ordering::Equal)
    });
    sorted.truncate(top_n);
    sorted
}
