//! Toy forward models.
//!
//! These stand in for the radiative-transfer engine in dry runs and tests.
//! Both are pure functions of the parameter vector and the wavelength grid.

use crate::domain::{Dataset, ParamVector};
use crate::engine::ForwardModel;
use crate::error::{HarnessError, Result};

/// Jupiter equatorial radius (m).
pub const R_JUP_M: f64 = 7.1492e7;

const PLANCK_H: f64 = 6.626_070_15e-34;
const LIGHT_C: f64 = 2.997_924_58e8;
const BOLTZMANN_K: f64 = 1.380_649e-23;

/// Flat spectrum. A `flux` parameter, when present, overrides the constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantSpectrum {
    flux: f64,
}

impl ConstantSpectrum {
    pub fn new(flux: f64) -> Self {
        Self { flux }
    }
}

impl ForwardModel for ConstantSpectrum {
    fn name(&self) -> &str {
        "constant"
    }

    fn spectrum(&self, params: &ParamVector, wavelengths: &[f64]) -> Result<Vec<f64>> {
        let flux = params.get("flux").copied().unwrap_or(self.flux);
        Ok(vec![flux; wavelengths.len()])
    }
}

/// Planck emitter of temperature `teff` (K) and radius `radius` (R_Jup) at a
/// fixed distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blackbody {
    distance_m: f64,
}

impl Blackbody {
    pub fn new(distance_m: f64) -> Self {
        Self { distance_m }
    }

    /// Place the emitter at the dataset's parallax distance.
    pub fn for_dataset(dataset: &Dataset) -> Self {
        Self::new(dataset.distance_m())
    }
}

impl ForwardModel for Blackbody {
    fn name(&self) -> &str {
        "blackbody"
    }

    fn spectrum(&self, params: &ParamVector, wavelengths: &[f64]) -> Result<Vec<f64>> {
        let teff = required(params, "teff")?;
        let radius = required(params, "radius")?;
        if !(teff > 0.0 && radius > 0.0) {
            return Err(HarnessError::ForwardModel(format!(
                "blackbody needs positive teff and radius, got teff={teff}, radius={radius}"
            )));
        }
        let dilution = std::f64::consts::PI * (radius * R_JUP_M / self.distance_m).powi(2);
        Ok(wavelengths
            .iter()
            .map(|&um| dilution * planck_per_um(um, teff))
            .collect())
    }
}

fn required(params: &ParamVector, name: &str) -> Result<f64> {
    params
        .get(name)
        .copied()
        .ok_or_else(|| HarnessError::ForwardModel(format!("missing parameter '{name}'")))
}

/// Spectral radiance B_λ(T) in W m⁻² µm⁻¹ sr⁻¹.
fn planck_per_um(wavelength_um: f64, temperature: f64) -> f64 {
    let lambda = wavelength_um * 1e-6;
    let x = PLANCK_H * LIGHT_C / (lambda * BOLTZMANN_K * temperature);
    // exp_m1 keeps the Rayleigh-Jeans tail accurate; huge x underflows to 0.
    let per_m = 2.0 * PLANCK_H * LIGHT_C * LIGHT_C / lambda.powi(5) / x.exp_m1();
    per_m * 1e-6
}
