//! Secondary quantities computed from a stored posterior.
//!
//! Nothing here is persisted by the runner. The computer caches one
//! [`DerivedQuantities`] per tag and recomputes it when the stored result
//! changes (detected through `completed_at`).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Dataset, ParamVector, RetrievalResult, Tag};
use crate::engine::models::R_JUP_M;
use crate::engine::{ForwardModel, checked_spectra, checked_spectrum};
use crate::error::{HarnessError, Result};
use crate::math::{Summary, log_space, percentile_sorted, resolution_grid};

pub mod residuals;
pub mod teff;

pub use residuals::*;
pub use teff::*;

/// Quantities that may carry a prior without being sampled directly.
pub const DERIVED_PARAMETERS: &[&str] = &["mass"];

/// Jupiter mass (kg).
pub const M_JUP_KG: f64 = 1.898_13e27;
/// Newtonian constant of gravitation (m³ kg⁻¹ s⁻²).
pub const G_NEWTON: f64 = 6.674_30e-11;

/// log10 cloud optical depth that effectively removes the cloud deck.
const CLOUDLESS_LOG_TAU: f64 = -100.0;

/// Mass in M_Jup from `logg` (cgs) and `radius` (R_Jup).
pub fn derived_mass(params: &ParamVector) -> Option<f64> {
    let logg = *params.get("logg")?;
    let radius = *params.get("radius")?;
    let g = 10f64.powf(logg - 2.0);
    let r = radius * R_JUP_M;
    Some(g * r * r / G_NEWTON / M_JUP_KG)
}

/// Look up a derived quantity by name.
pub fn derived_value(name: &str, params: &ParamVector) -> Option<f64> {
    match name {
        "mass" => derived_mass(params),
        _ => None,
    }
}

/// Median and 16th/84th percentiles per parameter, plus derivable quantities.
///
/// Samples are equal-weight, so the summary is unweighted.
pub fn summarize_posterior(result: &RetrievalResult) -> BTreeMap<String, Summary> {
    let names: BTreeSet<&String> = result.samples.iter().flat_map(|s| s.params.keys()).collect();

    let mut out = BTreeMap::new();
    for name in names {
        let values: Vec<f64> = result
            .samples
            .iter()
            .filter_map(|s| s.params.get(name).copied())
            .collect();
        if let Some(summary) = Summary::of(&values) {
            out.insert(name.clone(), summary);
        }
    }

    for &name in DERIVED_PARAMETERS {
        if out.contains_key(name) {
            continue;
        }
        let values: Option<Vec<f64>> = result
            .samples
            .iter()
            .map(|s| derived_value(name, &s.params))
            .collect();
        if let Some(summary) = values.as_deref().and_then(Summary::of) {
            out.insert(name.to_string(), summary);
        }
    }
    out
}

/// Tunables for derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivedSettings {
    /// Posterior draws used for Teff.
    pub teff_samples: usize,
    /// Posterior draws used for random spectra.
    pub spectra_samples: usize,
    pub oversample: OversamplePolicy,
    /// Integration grid for the bolometric flux (µm).
    pub teff_wavel_range: (f64, f64),
    pub teff_grid_points: usize,
    /// Grid for model and random spectra (µm).
    pub spectrum_wavel_range: (f64, f64),
    pub spectrum_resolution: f64,
    pub seed: u64,
}

impl Default for DerivedSettings {
    fn default() -> Self {
        Self {
            teff_samples: 30,
            spectra_samples: 30,
            oversample: OversamplePolicy::Clamp,
            teff_wavel_range: (0.3, 50.0),
            teff_grid_points: 2000,
            spectrum_wavel_range: (0.5, 6.0),
            spectrum_resolution: 500.0,
            seed: 42,
        }
    }
}

/// Upper bound on any derived wavelength grid.
pub const MAX_GRID_POINTS: usize = 1_000_000;

impl DerivedSettings {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(HarnessError::InvalidSettings(msg));
        if self.teff_samples == 0 {
            return invalid("derived.teff_samples must be a positive integer".to_string());
        }
        if self.spectra_samples == 0 {
            return invalid("derived.spectra_samples must be a positive integer".to_string());
        }
        if !(2..=MAX_GRID_POINTS).contains(&self.teff_grid_points) {
            return invalid(format!(
                "derived.teff_grid_points must be between 2 and {MAX_GRID_POINTS}, got {}",
                self.teff_grid_points
            ));
        }
        for (name, (lo, hi)) in [
            ("teff_wavel_range", self.teff_wavel_range),
            ("spectrum_wavel_range", self.spectrum_wavel_range),
        ] {
            if !(lo.is_finite() && hi.is_finite() && lo > 0.0 && hi > lo) {
                return invalid(format!("derived.{name} must satisfy 0 < min < max, got [{lo}, {hi}]"));
            }
        }
        let r = self.spectrum_resolution;
        if !(r.is_finite() && r > 0.0) {
            return invalid(format!("derived.spectrum_resolution must be positive, got {r}"));
        }
        let (lo, hi) = self.spectrum_wavel_range;
        let points = (hi / lo).ln() * r;
        if points >= MAX_GRID_POINTS as f64 {
            return invalid(format!(
                "derived.spectrum_resolution {r} needs about {points:.0} grid points over [{lo}, {hi}] um (limit {MAX_GRID_POINTS})"
            ));
        }
        Ok(())
    }
}

/// Highest-posterior sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestFit {
    /// Index into the stored samples.
    pub index: usize,
    pub params: ParamVector,
    pub log_likelihood: f64,
    pub log_prior: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpectrum {
    pub wavelengths: Vec<f64>,
    pub flux: Vec<f64>,
}

/// Spectra of random posterior draws on a common grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectraBundle {
    pub wavelengths: Vec<f64>,
    pub indices: Vec<usize>,
    pub fluxes: Vec<Vec<f64>>,
    /// Per-wavelength median across draws.
    pub median: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedQuantities {
    pub tag: Tag,
    /// `completed_at` of the result these were computed from.
    pub source_completed_at: DateTime<Utc>,
    pub best_fit: BestFit,
    pub teff: TeffSummary,
    pub model_spectrum: ModelSpectrum,
    /// Best fit with `log_tau_cloud` forced to -100, when the model has clouds.
    pub cloudless_spectrum: Option<ModelSpectrum>,
    pub spectra: SpectraBundle,
    pub residuals: Residuals,
    pub posterior: BTreeMap<String, Summary>,
}

pub struct DerivedQuantityComputer {
    model: Arc<dyn ForwardModel>,
    settings: DerivedSettings,
    cache: Mutex<HashMap<Tag, Arc<DerivedQuantities>>>,
}

impl DerivedQuantityComputer {
    pub fn new(model: Arc<dyn ForwardModel>, settings: DerivedSettings) -> Self {
        Self {
            model,
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &DerivedSettings {
        &self.settings
    }

    /// Sample with maximum `log_likelihood + log_prior`; ties go to the earliest.
    /// Samples whose log-posterior is not finite are never chosen.
    pub fn best_fit(&self, result: &RetrievalResult) -> Result<BestFit> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, s) in result.samples.iter().enumerate() {
            let lp = s.log_posterior();
            if !lp.is_finite() {
                continue;
            }
            match best {
                Some((_, b)) if lp <= b => {}
                _ => best = Some((idx, lp)),
            }
        }

        let (index, _) = best.ok_or_else(|| HarnessError::InsufficientSamples {
            tag: result.tag.to_string(),
            requested: 1,
            available: 0,
        })?;
        let s = &result.samples[index];
        Ok(BestFit {
            index,
            params: s.params.clone(),
            log_likelihood: s.log_likelihood,
            log_prior: s.log_prior,
        })
    }

    /// Teff from `sample_count` posterior draws.
    pub fn effective_temperature(
        &self,
        result: &RetrievalResult,
        dataset: &Dataset,
        sample_count: usize,
    ) -> Result<TeffSummary> {
        let mut rng = self.rng_for(&result.tag, 0);
        let indices = choose_indices(
            result.tag.as_str(),
            result.samples.len(),
            sample_count,
            self.settings.oversample,
            &mut rng,
        )?;

        let (w0, w1) = self.settings.teff_wavel_range;
        let grid = log_space(w0, w1, self.settings.teff_grid_points)?;
        let params: Vec<ParamVector> = indices
            .iter()
            .map(|&i| result.samples[i].params.clone())
            .collect();
        let fluxes = checked_spectra(self.model.as_ref(), &params, &grid)?;

        let distance = dataset.distance_m();
        let draws = params
            .iter()
            .zip(&fluxes)
            .map(|(p, flux)| {
                let radius = p.get("radius").copied().ok_or_else(|| {
                    HarnessError::ForwardModel(format!(
                        "'{}' has no radius parameter; Teff needs one",
                        result.tag
                    ))
                })?;
                bolometric_teff(&grid, flux, distance, radius)
            })
            .collect::<Result<Vec<f64>>>()?;

        let summary = Summary::of(&draws)
            .ok_or_else(|| HarnessError::ForwardModel("Teff draws are not finite".to_string()))?;
        debug!(tag = %result.tag, draws = draws.len(), median = summary.median, "effective temperature");

        Ok(TeffSummary {
            indices,
            draws,
            summary,
            requested: sample_count,
            policy: self.settings.oversample,
        })
    }

    /// Residuals of every dataset point at `best`.
    pub fn residuals(&self, dataset: &Dataset, best: &BestFit) -> Result<Residuals> {
        compute_residuals(dataset, &best.params, self.model.as_ref())
    }

    /// Spectra of `n` random posterior draws on the spectrum grid.
    pub fn spectra(&self, result: &RetrievalResult, n: usize) -> Result<SpectraBundle> {
        let mut rng = self.rng_for(&result.tag, 1);
        let indices = choose_indices(
            result.tag.as_str(),
            result.samples.len(),
            n,
            OversamplePolicy::Clamp,
            &mut rng,
        )?;
        let wavelengths = self.spectrum_grid()?;
        let params: Vec<ParamVector> = indices
            .iter()
            .map(|&i| result.samples[i].params.clone())
            .collect();
        let fluxes = checked_spectra(self.model.as_ref(), &params, &wavelengths)?;

        let median = (0..wavelengths.len())
            .map(|j| {
                let mut column: Vec<f64> = fluxes.iter().map(|f| f[j]).collect();
                column.sort_by(|a, b| a.total_cmp(b));
                percentile_sorted(&column, 50.0)
            })
            .collect();

        Ok(SpectraBundle {
            wavelengths,
            indices,
            fluxes,
            median,
        })
    }

    pub fn model_spectrum(&self, best: &BestFit) -> Result<ModelSpectrum> {
        self.spectrum_at(&best.params)
    }

    /// The best fit with clouds switched off, if the model has a cloud depth.
    pub fn cloudless_spectrum(&self, best: &BestFit) -> Result<Option<ModelSpectrum>> {
        if !best.params.contains_key("log_tau_cloud") {
            return Ok(None);
        }
        let mut params = best.params.clone();
        params.insert("log_tau_cloud".to_string(), CLOUDLESS_LOG_TAU);
        self.spectrum_at(&params).map(Some)
    }

    /// Median and 16th/84th percentiles per parameter, plus derivable quantities.
    pub fn posterior_summary(&self, result: &RetrievalResult) -> BTreeMap<String, Summary> {
        summarize_posterior(result)
    }

    /// Everything at once, cached per tag.
    pub fn derive(&self, result: &RetrievalResult, dataset: &Dataset) -> Result<Arc<DerivedQuantities>> {
        if let Some(hit) = self.cached(&result.tag) {
            if hit.source_completed_at == result.completed_at {
                debug!(tag = %result.tag, "derived quantities served from cache");
                return Ok(hit);
            }
            debug!(tag = %result.tag, "stored result changed; recomputing derived quantities");
        }

        let best_fit = self.best_fit(result)?;
        let teff = self.effective_temperature(result, dataset, self.settings.teff_samples)?;
        let model_spectrum = self.model_spectrum(&best_fit)?;
        let cloudless_spectrum = self.cloudless_spectrum(&best_fit)?;
        let spectra = self.spectra(result, self.settings.spectra_samples)?;
        let residuals = self.residuals(dataset, &best_fit)?;
        let posterior = self.posterior_summary(result);

        let derived = Arc::new(DerivedQuantities {
            tag: result.tag.clone(),
            source_completed_at: result.completed_at,
            best_fit,
            teff,
            model_spectrum,
            cloudless_spectrum,
            spectra,
            residuals,
            posterior,
        });

        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(result.tag.clone(), Arc::clone(&derived));
        Ok(derived)
    }

    /// Drop any cached quantities for `tag`.
    pub fn invalidate(&self, tag: &str) {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(tag);
    }

    fn cached(&self, tag: &Tag) -> Option<Arc<DerivedQuantities>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(tag)
            .cloned()
    }

    fn spectrum_grid(&self) -> Result<Vec<f64>> {
        let (w0, w1) = self.settings.spectrum_wavel_range;
        resolution_grid(w0, w1, self.settings.spectrum_resolution)
    }

    fn spectrum_at(&self, params: &ParamVector) -> Result<ModelSpectrum> {
        let wavelengths = self.spectrum_grid()?;
        let flux = checked_spectrum(self.model.as_ref(), params, &wavelengths)?;
        Ok(ModelSpectrum { wavelengths, flux })
    }

    /// Deterministic per-tag stream so repeated derivations agree.
    fn rng_for(&self, tag: &Tag, stream: u64) -> StdRng {
        let tag_bits = tag
            .as_str()
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
        StdRng::seed_from_u64(self.settings.seed ^ tag_bits ^ stream.rotate_left(32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PosteriorSample;
    use crate::engine::{Blackbody, ConstantSpectrum};
    use crate::test_support::{configuration, dataset, params, result_from_samples, result_with, sample};

    fn computer(model: Arc<dyn ForwardModel>) -> DerivedQuantityComputer {
        DerivedQuantityComputer::new(
            model,
            DerivedSettings {
                teff_grid_points: 400,
                spectrum_resolution: 20.0,
                ..DerivedSettings::default()
            },
        )
    }

    #[test]
    fn best_fit_maximizes_log_posterior_with_first_tie() {
        let c = computer(Arc::new(ConstantSpectrum::new(1.0)));
        let result = result_with(&configuration("a"), &[(3.0, -5.0), (4.0, -1.0), (5.0, -1.0)]);
        let best = c.best_fit(&result).unwrap();
        assert_eq!(best.index, 1);
        assert_eq!(best.params["logg"], 4.0);
    }

    #[test]
    fn best_fit_skips_non_finite_log_posterior() {
        let c = computer(Arc::new(ConstantSpectrum::new(1.0)));
        let result = result_with(&configuration("a"), &[(3.0, f64::NAN), (4.0, -2.0), (5.0, f64::INFINITY)]);
        assert_eq!(c.best_fit(&result).unwrap().index, 1);

        let all_bad = result_with(&configuration("a"), &[(3.0, f64::NAN)]);
        assert!(matches!(
            c.best_fit(&all_bad),
            Err(HarnessError::InsufficientSamples { available: 0, .. })
        ));
    }

    #[test]
    fn best_fit_counts_prior() {
        let c = computer(Arc::new(ConstantSpectrum::new(1.0)));
        let mut result = result_with(&configuration("a"), &[(3.0, -1.0), (4.0, -1.5)]);
        result.samples[0].log_prior = -2.0;
        assert_eq!(c.best_fit(&result).unwrap().index, 1);
    }

    #[test]
    fn best_fit_of_empty_posterior_is_insufficient() {
        let c = computer(Arc::new(ConstantSpectrum::new(1.0)));
        let result = result_with(&configuration("a"), &[]);
        assert!(matches!(
            c.best_fit(&result),
            Err(HarnessError::InsufficientSamples { .. })
        ));
    }

    fn blackbody_result(n: usize) -> RetrievalResult {
        let samples: Vec<PosteriorSample> = (0..n)
            .map(|i| {
                sample(
                    params(&[("teff", 1400.0 + 10.0 * i as f64), ("radius", 1.0), ("logg", 5.2)]),
                    -(i as f64),
                )
            })
            .collect();
        result_from_samples(&configuration("bb"), samples)
    }

    #[test]
    fn teff_tracks_blackbody_temperature() {
        let ds = dataset();
        let c = DerivedQuantityComputer::new(
            Arc::new(Blackbody::for_dataset(&ds)),
            DerivedSettings {
                teff_wavel_range: (0.1, 200.0),
                teff_grid_points: 4000,
                ..DerivedSettings::default()
            },
        );
        let result = blackbody_result(10);
        let teff = c.effective_temperature(&result, &ds, 30).unwrap();

        // Clamped to the ten stored samples, each used once.
        assert_eq!(teff.draws.len(), 10);
        for (&idx, &t) in teff.indices.iter().zip(&teff.draws) {
            let truth = 1400.0 + 10.0 * idx as f64;
            assert!((t - truth).abs() < 5.0, "draw {idx}: {t} vs {truth}");
        }
    }

    #[test]
    fn teff_with_zero_draws_is_insufficient() {
        let ds = dataset();
        let c = computer(Arc::new(Blackbody::for_dataset(&ds)));
        assert!(matches!(
            c.effective_temperature(&blackbody_result(10), &ds, 0),
            Err(HarnessError::InsufficientSamples { requested: 0, .. })
        ));
    }

    #[test]
    fn cloudless_variant_only_with_cloud_parameter() {
        let c = computer(Arc::new(ConstantSpectrum::new(1.0)));
        let mut best = BestFit {
            index: 0,
            params: params(&[("logg", 4.0)]),
            log_likelihood: 0.0,
            log_prior: 0.0,
        };
        assert!(c.cloudless_spectrum(&best).unwrap().is_none());
        best.params.insert("log_tau_cloud".to_string(), 0.3);
        assert!(c.cloudless_spectrum(&best).unwrap().is_some());
    }

    #[test]
    fn posterior_summary_includes_derived_mass() {
        let c = computer(Arc::new(ConstantSpectrum::new(1.0)));
        let summary = c.posterior_summary(&blackbody_result(5));
        assert!(summary.contains_key("teff"));
        let mass = summary["mass"].median;
        let expected = derived_mass(&params(&[("logg", 5.2), ("radius", 1.0)])).unwrap();
        assert!((mass - expected).abs() < 1e-9);
    }

    #[test]
    fn derive_is_cached_until_result_changes() {
        let ds = dataset();
        let c = computer(Arc::new(Blackbody::for_dataset(&ds)));
        let mut result = blackbody_result(8);

        let first = c.derive(&result, &ds).unwrap();
        let second = c.derive(&result, &ds).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        result.completed_at = result.completed_at + chrono::Duration::seconds(1);
        let third = c.derive(&result, &ds).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.source_completed_at, result.completed_at);
    }

    #[test]
    fn mass_follows_surface_gravity() {
        // logg 5.0 (cgs), 1 R_Jup → ~40 M_Jup
        let m = derived_mass(&params(&[("logg", 5.0), ("radius", 1.0)])).unwrap();
        assert!((m - 40.3).abs() < 0.5, "mass={m}");
        assert!(derived_mass(&params(&[("logg", 5.0)])).is_none());
    }
}
