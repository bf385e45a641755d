//! Effective temperature from posterior draws.
//!
//! Each draw is forward-modelled on a wide log-spaced grid, the flux density is
//! integrated to a bolometric flux, and the Stefan–Boltzmann law is inverted
//! with the distance from the parallax and the radius from the draw:
//!
//! `Teff = (F_bol d² / (σ R²))^¼`

use clap::ValueEnum;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::engine::models::R_JUP_M;
use crate::error::{HarnessError, Result};
use crate::math::{Summary, trapezoid};

/// Stefan–Boltzmann constant (W m⁻² K⁻⁴).
pub const SIGMA_SB: f64 = 5.670_374_419e-8;

/// What to do when more draws are requested than the posterior holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OversamplePolicy {
    /// Use every stored sample once.
    #[default]
    Clamp,
    /// Fail with `InsufficientSamples`.
    Error,
    /// Draw with replacement.
    Resample,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeffSummary {
    /// Sample indices that were drawn, in draw order.
    pub indices: Vec<usize>,
    /// Teff (K) per draw.
    pub draws: Vec<f64>,
    pub summary: Summary,
    pub requested: usize,
    pub policy: OversamplePolicy,
}

/// Pick `requested` sample indices out of `available`.
///
/// Without replacement unless the policy is `Resample` and the request exceeds
/// the posterior.
pub fn choose_indices(
    tag: &str,
    available: usize,
    requested: usize,
    policy: OversamplePolicy,
    rng: &mut StdRng,
) -> Result<Vec<usize>> {
    if requested == 0 || available == 0 {
        return Err(HarnessError::InsufficientSamples {
            tag: tag.to_string(),
            requested,
            available,
        });
    }
    if requested <= available {
        return Ok(rand::seq::index::sample(rng, available, requested).into_vec());
    }
    match policy {
        OversamplePolicy::Clamp => Ok(rand::seq::index::sample(rng, available, available).into_vec()),
        OversamplePolicy::Error => Err(HarnessError::InsufficientSamples {
            tag: tag.to_string(),
            requested,
            available,
        }),
        OversamplePolicy::Resample => Ok((0..requested).map(|_| rng.gen_range(0..available)).collect()),
    }
}

/// Teff (K) of one spectrum.
///
/// Wavelengths in µm, flux in W m⁻² µm⁻¹, distance in m, radius in R_Jup.
pub fn bolometric_teff(wavelengths: &[f64], flux: &[f64], distance_m: f64, radius_rjup: f64) -> Result<f64> {
    if !(radius_rjup.is_finite() && radius_rjup > 0.0) {
        return Err(HarnessError::ForwardModel(format!(
            "radius must be positive to derive Teff, got {radius_rjup}"
        )));
    }
    let f_bol = trapezoid(wavelengths, flux);
    let radius_m = radius_rjup * R_JUP_M;
    let teff = (f_bol * distance_m * distance_m / (SIGMA_SB * radius_m * radius_m)).powf(0.25);
    if !teff.is_finite() {
        return Err(HarnessError::ForwardModel(format!(
            "non-finite Teff from bolometric flux {f_bol}"
        )));
    }
    Ok(teff)
}
