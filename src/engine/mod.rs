//! Seams to the external collaborators: the sampling engine and the forward model.
//!
//! The harness never does radiative transfer or nested sampling itself. It
//! drives a [`Sampler`] one iteration at a time so it can checkpoint and honour
//! cancellation between iterations, and it asks a [`ForwardModel`] for model
//! spectra when deriving quantities from a stored posterior.
//!
//! Implementations shipped here:
//!
//! - [`external`]: spawns the production engine as a child process (JSON job files)
//! - [`synthetic`]: a reference prior-draw sampler for dry runs and tests
//! - [`models`]: toy forward models (constant spectrum, blackbody)

use serde::{Deserialize, Serialize};

use crate::domain::{
    Checkpoint, Configuration, Dataset, Diagnostics, ParamVector, PosteriorSample, SamplerSettings,
};
use crate::error::{HarnessError, Result};

pub mod external;
pub mod likelihood;
pub mod models;
pub mod synthetic;

pub use external::{ExternalForwardModel, ExternalSampler};
pub use likelihood::*;
pub use models::{Blackbody, ConstantSpectrum};
pub use synthetic::PriorSampler;

/// Everything a sampler needs to start a run.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SamplingJob<'a> {
    pub configuration: &'a Configuration,
    pub dataset: &'a Dataset,
    pub settings: &'a SamplerSettings,
}

/// Result of advancing a session by one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue { iteration: u64 },
    Converged,
}

/// Samples plus diagnostics, as returned by an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posterior {
    pub samples: Vec<PosteriorSample>,
    pub diagnostics: Diagnostics,
}

impl Posterior {
    /// Reject output that could not be stored faithfully as JSON.
    pub fn ensure_finite(&self, tag: &str) -> Result<()> {
        for (idx, s) in self.samples.iter().enumerate() {
            let finite = s.log_likelihood.is_finite()
                && s.log_prior.is_finite()
                && s.weight.is_finite()
                && s.params.values().all(|v| v.is_finite());
            if !finite {
                return Err(HarnessError::Sampler {
                    tag: tag.to_string(),
                    cause: format!("sample {idx} contains a non-finite value"),
                });
            }
        }
        let d = &self.diagnostics;
        if !(d.log_evidence.is_finite() && d.log_evidence_err.is_finite()) {
            return Err(HarnessError::Sampler {
                tag: tag.to_string(),
                cause: "evidence estimate is not finite".to_string(),
            });
        }
        Ok(())
    }
}

/// A sampling engine.
pub trait Sampler: Send + Sync {
    /// Stable engine name, recorded in results and checkpoints.
    fn name(&self) -> &str;

    /// Start a session, optionally continuing from a checkpoint this engine wrote.
    fn begin(
        &self,
        job: SamplingJob<'_>,
        resume_from: Option<&Checkpoint>,
    ) -> Result<Box<dyn SamplerSession>>;
}

/// One in-flight run.
pub trait SamplerSession {
    /// Iterations completed so far (including those restored from a checkpoint).
    fn iteration(&self) -> u64;

    fn step(&mut self) -> Result<StepOutcome>;

    /// Opaque state sufficient to resume this session later.
    fn checkpoint_payload(&self) -> Result<serde_json::Value>;

    /// Posterior of a converged session.
    fn finish(self: Box<Self>) -> Result<Posterior>;

    /// Whatever posterior exists so far, if the engine can produce one.
    fn partial(&self) -> Option<Posterior>;

    /// Stop any background work. Called on cancellation.
    fn abort(&mut self) {}
}

/// Parameters → model spectrum (W m⁻² µm⁻¹ on the given µm grid).
pub trait ForwardModel: Send + Sync {
    fn name(&self) -> &str;

    fn spectrum(&self, params: &ParamVector, wavelengths: &[f64]) -> Result<Vec<f64>>;

    /// Batch evaluation; engines with a per-call startup cost should override this.
    fn spectra(&self, params: &[ParamVector], wavelengths: &[f64]) -> Result<Vec<Vec<f64>>> {
        params
            .iter()
            .map(|p| self.spectrum(p, wavelengths))
            .collect()
    }
}

/// Evaluate a forward model and reject malformed or non-finite output.
pub fn checked_spectrum(
    model: &dyn ForwardModel,
    params: &ParamVector,
    wavelengths: &[f64],
) -> Result<Vec<f64>> {
    let flux = model.spectrum(params, wavelengths)?;
    check_flux(model.name(), &flux, wavelengths.len())?;
    Ok(flux)
}

/// Batch form of [`checked_spectrum`].
pub fn checked_spectra(
    model: &dyn ForwardModel,
    params: &[ParamVector],
    wavelengths: &[f64],
) -> Result<Vec<Vec<f64>>> {
    let fluxes = model.spectra(params, wavelengths)?;
    if fluxes.len() != params.len() {
        return Err(HarnessError::ForwardModel(format!(
            "{} returned {} spectra for {} parameter vectors",
            model.name(),
            fluxes.len(),
            params.len()
        )));
    }
    for flux in &fluxes {
        check_flux(model.name(), flux, wavelengths.len())?;
    }
    Ok(fluxes)
}

fn check_flux(name: &str, flux: &[f64], expected: usize) -> Result<()> {
    if flux.len() != expected {
        return Err(HarnessError::ForwardModel(format!(
            "{name} returned {} flux values for {expected} wavelengths",
            flux.len()
        )));
    }
    if let Some(idx) = flux.iter().position(|v| !v.is_finite()) {
        return Err(HarnessError::ForwardModel(format!(
            "{name} returned a non-finite flux at index {idx}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl ForwardModel for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn spectrum(&self, _params: &ParamVector, wavelengths: &[f64]) -> Result<Vec<f64>> {
            Ok(wavelengths.iter().map(|_| f64::NAN).collect())
        }
    }

    #[test]
    fn non_finite_flux_is_an_error() {
        let err = checked_spectrum(&Broken, &ParamVector::new(), &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, HarnessError::ForwardModel(_)));
    }

    #[test]
    fn wrong_length_is_an_error() {
        let model = ConstantSpectrum::new(1.0);
        let flux = checked_spectrum(&model, &ParamVector::new(), &[1.0, 2.0]).unwrap();
        assert_eq!(flux, vec![1.0, 1.0]);
        assert!(check_flux("x", &flux, 3).is_err());
    }
}
