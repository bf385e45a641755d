//! Reference sampler: importance sampling from the prior.
//!
//! Each iteration draws `live_points` parameter vectors from the prior box,
//! evaluates their likelihoods in parallel and accumulates them. The run
//! converges once the Kish effective sample size of the accumulated draws
//! reaches `live_points`, or after `max_iterations`. The posterior is an
//! equal-weight resample of `live_points` draws.
//!
//! A Normal prior on a bounded parameter is drawn from the Normal truncated to
//! the bounds when at least `MIN_REJECTION_MASS` of it lies inside them.
//! Otherwise the parameter is drawn uniformly and the truncated prior density
//! enters the importance weight instead.
//!
//! Every iteration has its own RNG stream derived from the seed, so a session
//! resumed from a checkpoint produces exactly the draws an uninterrupted one
//! would have.

use std::sync::Arc;

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::derive::derived_value;
use crate::domain::{
    Checkpoint, Configuration, Dataset, Diagnostics, Interval, ParamVector, PosteriorSample, Prior,
};
use crate::engine::{
    ForwardModel, Posterior, Sampler, SamplerSession, SamplingJob, StepOutcome, log_likelihood,
    selected_points,
};
use crate::error::{HarnessError, Result};
use crate::math::log_sum_exp;

/// Smallest in-bounds prior mass still drawn by rejection.
const MIN_REJECTION_MASS: f64 = 0.01;
/// Rejection attempts before a draw fails.
const MAX_REJECTIONS: usize = 10_000;
/// Trapezoid panels per prior standard deviation when integrating prior mass.
const PANELS_PER_STD: f64 = 8.0;
const MIN_PANELS: usize = 2048;
const MAX_PANELS: usize = 1 << 20;
const RESAMPLE_SALT: u64 = 0x5EED_CAFE_F00D_0001;

pub struct PriorSampler {
    model: Arc<dyn ForwardModel>,
}

impl PriorSampler {
    pub fn new(model: Arc<dyn ForwardModel>) -> Self {
        Self { model }
    }
}

impl Sampler for PriorSampler {
    fn name(&self) -> &str {
        "prior-sampler"
    }

    fn begin(
        &self,
        job: SamplingJob<'_>,
        resume_from: Option<&Checkpoint>,
    ) -> Result<Box<dyn SamplerSession>> {
        let selected = selected_points(job.configuration, job.dataset)?;
        let proposals = proposals(job.configuration)?;
        let state = match resume_from {
            Some(checkpoint) => serde_json::from_value(checkpoint.payload.clone()).map_err(|e| {
                HarnessError::Sampler {
                    tag: job.configuration.tag.to_string(),
                    cause: format!("unreadable checkpoint: {e}"),
                }
            })?,
            None => SessionState {
                seed: job.settings.seed,
                iteration: 0,
                done: false,
                draws: Vec::new(),
            },
        };

        Ok(Box::new(PriorSession {
            model: Arc::clone(&self.model),
            configuration: job.configuration.clone(),
            dataset: job.dataset.clone(),
            selected,
            proposals,
            live_points: job.settings.live_points,
            max_iterations: job.settings.max_iterations,
            state,
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Draw {
    sample: PosteriorSample,
    /// `ln L` plus priors on derived quantities and on uniformly drawn
    /// parameters; other bounded priors are sampled directly.
    log_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionState {
    seed: u64,
    iteration: u64,
    done: bool,
    /// Every draw so far: `live_points * iteration` entries, all of them in
    /// each checkpoint payload.
    draws: Vec<Draw>,
}

struct PriorSession {
    model: Arc<dyn ForwardModel>,
    configuration: Configuration,
    dataset: Dataset,
    selected: Vec<usize>,
    proposals: Vec<(String, Proposal)>,
    live_points: usize,
    max_iterations: u64,
    state: SessionState,
}

/// How one bounded parameter is drawn.
#[derive(Debug, Clone, Copy)]
enum Proposal {
    /// Flat prior over `[lower, upper]`.
    Uniform { lower: f64, upper: f64 },
    /// Normal prior, rejected until inside the bounds.
    Truncated { normal: Normal<f64>, interval: Interval },
    /// Normal prior with little in-bounds mass: drawn uniformly and weighted by
    /// `prior.ln_density(v) + ln_correction`, where
    /// `ln_correction = ln(width) - ln(in-bounds mass)`.
    Weighted {
        lower: f64,
        upper: f64,
        prior: Prior,
        ln_correction: f64,
    },
}

fn proposals(configuration: &Configuration) -> Result<Vec<(String, Proposal)>> {
    let sampler_error = |cause: String| HarnessError::Sampler {
        tag: configuration.tag.to_string(),
        cause,
    };

    let mut out = Vec::with_capacity(configuration.bounds.len());
    for (name, &interval) in &configuration.bounds {
        let (lower, upper) = (interval.lower, interval.upper);
        let proposal = match configuration.priors.get(name) {
            Some(&prior) if upper > lower => {
                let Prior::Normal { mean, std } = prior;
                let ln_mass = ln_prior_mass(&prior, interval);
                if !ln_mass.is_finite() {
                    return Err(sampler_error(format!(
                        "prior on '{name}' has no mass inside [{lower}, {upper}]"
                    )));
                }
                if ln_mass >= MIN_REJECTION_MASS.ln() {
                    let normal = Normal::new(mean, std)
                        .map_err(|e| sampler_error(format!("prior on '{name}': {e}")))?;
                    Proposal::Truncated { normal, interval }
                } else {
                    debug!(
                        tag = %configuration.tag,
                        parameter = %name,
                        mass = ln_mass.exp(),
                        "prior mostly outside bounds; drawing uniformly with importance weights"
                    );
                    Proposal::Weighted {
                        lower,
                        upper,
                        prior,
                        ln_correction: interval.width().ln() - ln_mass,
                    }
                }
            }
            _ => Proposal::Uniform { lower, upper },
        };
        out.push((name.clone(), proposal));
    }
    Ok(out)
}

/// `ln` of the prior's mass inside `interval` (trapezoid rule summed in log space).
fn ln_prior_mass(prior: &Prior, interval: Interval) -> f64 {
    let Prior::Normal { std, .. } = *prior;
    let width = interval.width();
    let panels = ((width / std * PANELS_PER_STD).ceil() as usize).clamp(MIN_PANELS, MAX_PANELS);
    let h = width / panels as f64;
    let terms: Vec<f64> = (0..=panels)
        .map(|i| {
            let x = if i == panels {
                interval.upper
            } else {
                interval.lower + h * i as f64
            };
            let end_weight = if i == 0 || i == panels { 0.5f64.ln() } else { 0.0 };
            prior.ln_density(x) + end_weight
        })
        .collect();
    log_sum_exp(&terms) + h.ln()
}

impl PriorSession {
    fn sampler_error(&self, cause: impl Into<String>) -> HarnessError {
        HarnessError::Sampler {
            tag: self.configuration.tag.to_string(),
            cause: cause.into(),
        }
    }

    fn draw_params(&self, rng: &mut StdRng) -> Result<ParamVector> {
        let mut params = ParamVector::new();
        for (name, proposal) in &self.proposals {
            let value = match *proposal {
                Proposal::Uniform { lower, upper } | Proposal::Weighted { lower, upper, .. } => {
                    uniform(rng, lower, upper)
                }
                Proposal::Truncated { normal, interval } => (0..MAX_REJECTIONS)
                    .map(|_| normal.sample(rng))
                    .find(|&v| interval.contains(v))
                    .ok_or_else(|| {
                        self.sampler_error(format!(
                            "no draw of the prior on '{name}' fell inside [{}, {}]",
                            interval.lower, interval.upper
                        ))
                    })?,
            };
            params.insert(name.clone(), value);
        }
        Ok(params)
    }

    fn evaluate(&self, params: ParamVector) -> Result<Draw> {
        let ll = log_likelihood(&self.dataset, &self.selected, self.model.as_ref(), &params)?;

        let mut log_prior = 0.0;
        let mut derived_log_prior = 0.0;
        for (name, prior) in &self.configuration.priors {
            match params.get(name) {
                Some(&v) => log_prior += prior.ln_density(v),
                None => {
                    let v = derived_value(name, &params).ok_or_else(|| {
                        self.sampler_error(format!("cannot derive '{name}' from the sampled parameters"))
                    })?;
                    let density = prior.ln_density(v);
                    log_prior += density;
                    derived_log_prior += density;
                }
            }
        }

        let mut proposal_correction = 0.0;
        for (name, proposal) in &self.proposals {
            if let Proposal::Weighted {
                prior,
                ln_correction,
                ..
            } = proposal
            {
                if let Some(&v) = params.get(name) {
                    proposal_correction += prior.ln_density(v) + ln_correction;
                }
            }
        }

        Ok(Draw {
            sample: PosteriorSample {
                params,
                log_likelihood: ll,
                log_prior,
                weight: 1.0,
            },
            log_weight: ll + derived_log_prior + proposal_correction,
        })
    }

    fn effective_sample_size(&self) -> f64 {
        let log_w: Vec<f64> = self.state.draws.iter().map(|d| d.log_weight).collect();
        let lse = log_sum_exp(&log_w);
        if !lse.is_finite() {
            return 0.0;
        }
        let sum_sq: f64 = log_w.iter().map(|w| (2.0 * (w - lse)).exp()).sum();
        1.0 / sum_sq
    }

    fn posterior(&self) -> Result<Posterior> {
        let n = self.state.draws.len();
        if n == 0 {
            return Err(self.sampler_error("no draws to build a posterior from"));
        }
        let log_w: Vec<f64> = self.state.draws.iter().map(|d| d.log_weight).collect();
        let lse = log_sum_exp(&log_w);
        if !lse.is_finite() {
            return Err(self.sampler_error("every draw has zero posterior weight"));
        }

        let weights: Vec<f64> = log_w.iter().map(|w| (w - lse).exp()).collect();
        let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
        let ess = 1.0 / sum_sq;
        let rel_var = ((n as f64) * sum_sq - 1.0).max(0.0) / n as f64;

        let index = WeightedIndex::new(&weights)
            .map_err(|e| self.sampler_error(format!("resampling failed: {e}")))?;
        let mut rng = StdRng::seed_from_u64(self.state.seed ^ RESAMPLE_SALT);
        let samples = (0..self.live_points)
            .map(|_| self.state.draws[index.sample(&mut rng)].sample.clone())
            .collect();

        Ok(Posterior {
            samples,
            diagnostics: Diagnostics {
                log_evidence: lse - (n as f64).ln(),
                log_evidence_err: rel_var.sqrt(),
                live_points: self.live_points,
                iterations: self.state.iteration,
                converged: ess >= self.live_points as f64,
            },
        })
    }
}

impl SamplerSession for PriorSession {
    fn iteration(&self) -> u64 {
        self.state.iteration
    }

    fn step(&mut self) -> Result<StepOutcome> {
        if self.state.done {
            return Ok(StepOutcome::Converged);
        }

        let mut rng = StdRng::seed_from_u64(iteration_seed(self.state.seed, self.state.iteration));
        let batch = (0..self.live_points)
            .map(|_| self.draw_params(&mut rng))
            .collect::<Result<Vec<_>>>()?;

        // Likelihoods are independent; output order follows draw order.
        let draws = batch
            .into_par_iter()
            .map(|params| self.evaluate(params))
            .collect::<Result<Vec<_>>>()?;

        self.state.draws.extend(draws);
        self.state.iteration += 1;

        let ess = self.effective_sample_size();
        debug!(
            tag = %self.configuration.tag,
            iteration = self.state.iteration,
            draws = self.state.draws.len(),
            ess,
            "prior sampler iteration"
        );

        if ess >= self.live_points as f64 || self.state.iteration >= self.max_iterations {
            self.state.done = true;
            Ok(StepOutcome::Converged)
        } else {
            Ok(StepOutcome::Continue {
                iteration: self.state.iteration,
            })
        }
    }

    fn checkpoint_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn finish(self: Box<Self>) -> Result<Posterior> {
        self.posterior()
    }

    fn partial(&self) -> Option<Posterior> {
        self.posterior().ok()
    }
}

fn uniform(rng: &mut StdRng, lower: f64, upper: f64) -> f64 {
    if lower == upper {
        lower
    } else {
        rng.gen_range(lower..=upper)
    }
}

/// SplitMix64 over `seed + iteration`, so neighbouring iterations get unrelated streams.
fn iteration_seed(seed: u64, iteration: u64) -> u64 {
    let mut z = seed.wrapping_add(iteration.wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::domain::{Interval, ModelToggles, SamplerSettings, Tag};
    use crate::engine::ConstantSpectrum;
    use crate::test_support::dataset;

    fn flux_configuration() -> Configuration {
        let mut bounds = BTreeMap::new();
        bounds.insert("flux".to_string(), Interval::new(0.5, 3.5));
        Configuration::new(
            Tag::new("flux-only").unwrap(),
            bounds,
            BTreeMap::new(),
            ModelToggles::default(),
        )
    }

    fn settings() -> SamplerSettings {
        SamplerSettings {
            live_points: 16,
            max_iterations: 4,
            seed: 7,
            ..SamplerSettings::default()
        }
    }

    fn drive(mut session: Box<dyn SamplerSession>) -> Posterior {
        while session.step().unwrap() != StepOutcome::Converged {}
        session.finish().unwrap()
    }

    #[test]
    fn resumed_session_matches_uninterrupted_run() {
        let sampler = PriorSampler::new(Arc::new(ConstantSpectrum::new(1.0)));
        let config = flux_configuration();
        let ds = dataset();
        let settings = settings();
        let job = SamplingJob {
            configuration: &config,
            dataset: &ds,
            settings: &settings,
        };

        let uninterrupted = drive(sampler.begin(job, None).unwrap());

        let mut first = sampler.begin(job, None).unwrap();
        first.step().unwrap();
        let checkpoint = Checkpoint {
            tag: config.tag.clone(),
            engine: sampler.name().to_string(),
            iteration: first.iteration(),
            payload: first.checkpoint_payload().unwrap(),
            updated_at: Utc::now(),
        };
        drop(first);

        let resumed = sampler.begin(job, Some(&checkpoint)).unwrap();
        assert_eq!(resumed.iteration(), 1);
        assert_eq!(drive(resumed), uninterrupted);
    }

    #[test]
    fn posterior_has_live_points_samples_inside_bounds() {
        let sampler = PriorSampler::new(Arc::new(ConstantSpectrum::new(1.0)));
        let config = flux_configuration();
        let ds = dataset();
        let settings = settings();
        let posterior = drive(
            sampler
                .begin(
                    SamplingJob {
                        configuration: &config,
                        dataset: &ds,
                        settings: &settings,
                    },
                    None,
                )
                .unwrap(),
        );

        assert_eq!(posterior.samples.len(), 16);
        assert!(posterior.diagnostics.log_evidence.is_finite());
        assert!(posterior.diagnostics.iterations >= 1);
        assert!(posterior.diagnostics.iterations <= 4);
        for s in &posterior.samples {
            assert!(Interval::new(0.5, 3.5).contains(s.params["flux"]));
        }
        posterior.ensure_finite("t").unwrap();
    }

    #[test]
    fn derived_mass_prior_enters_log_prior() {
        let sampler = PriorSampler::new(Arc::new(ConstantSpectrum::new(1.0)));
        let mut config = flux_configuration();
        config.bounds.insert("logg".to_string(), Interval::new(4.5, 5.5));
        config.bounds.insert("radius".to_string(), Interval::new(0.8, 1.2));
        config.priors.insert(
            "mass".to_string(),
            Prior::Normal {
                mean: 69.5,
                std: 0.5,
            },
        );
        let ds = dataset();
        let settings = settings();
        let posterior = drive(
            sampler
                .begin(
                    SamplingJob {
                        configuration: &config,
                        dataset: &ds,
                        settings: &settings,
                    },
                    None,
                )
                .unwrap(),
        );
        assert!(posterior.samples.iter().all(|s| s.log_prior != 0.0));
    }

    fn posterior_flux_mean(priors: &[(f64, f64)]) -> f64 {
        let sampler = PriorSampler::new(Arc::new(ConstantSpectrum::new(1.0)));
        let mut config = flux_configuration();
        config.bounds.insert("flux".to_string(), Interval::new(0.0, 4.0));
        for &(mean, std) in priors {
            config.priors.insert("flux".to_string(), Prior::Normal { mean, std });
        }
        let ds = dataset();
        let settings = SamplerSettings {
            live_points: 400,
            max_iterations: 200,
            seed: 3,
            ..SamplerSettings::default()
        };
        let posterior = drive(
            sampler
                .begin(
                    SamplingJob {
                        configuration: &config,
                        dataset: &ds,
                        settings: &settings,
                    },
                    None,
                )
                .unwrap(),
        );
        assert!(posterior.diagnostics.converged);
        assert!(posterior.diagnostics.log_evidence.is_finite());
        let n = posterior.samples.len() as f64;
        posterior.samples.iter().map(|s| s.params["flux"]).sum::<f64>() / n
    }

    // Fixture likelihood in `flux`: Gaussian with mean 1.5 and precision 24.
    #[test]
    fn flat_prior_posterior_follows_the_likelihood() {
        let mean = posterior_flux_mean(&[]);
        assert!((mean - 1.5).abs() < 0.08, "mean = {mean}");
    }

    #[test]
    fn in_bounds_normal_prior_pulls_the_posterior() {
        // N(2.5, 0.2): precision 25, combined mean (24 * 1.5 + 25 * 2.5) / 49.
        let mean = posterior_flux_mean(&[(2.5, 0.2)]);
        assert!((mean - 98.5 / 49.0).abs() < 0.08, "mean = {mean}");
    }

    #[test]
    fn out_of_bounds_normal_prior_still_pulls_the_posterior() {
        // N(10, 0.5): precision 4, combined mean (24 * 1.5 + 4 * 10) / 28.
        let mean = posterior_flux_mean(&[(10.0, 0.5)]);
        assert!((mean - 76.0 / 28.0).abs() < 0.08, "mean = {mean}");
    }

    #[test]
    fn prior_mass_picks_the_proposal() {
        let standard = Prior::Normal { mean: 0.0, std: 1.0 };
        assert!(ln_prior_mass(&standard, Interval::new(-10.0, 10.0)).abs() < 1e-6);
        assert!((ln_prior_mass(&standard, Interval::new(0.0, 10.0)) - 0.5f64.ln()).abs() < 1e-6);

        // Phi(-12) = 1.7765e-33.
        let far = Prior::Normal { mean: 10.0, std: 0.5 };
        let ln_mass = ln_prior_mass(&far, Interval::new(0.0, 4.0));
        assert!((ln_mass - 1.7765e-33f64.ln()).abs() < 0.01, "ln_mass = {ln_mass}");

        let mut config = flux_configuration();
        config.bounds.insert("flux".to_string(), Interval::new(0.0, 4.0));
        config.priors.insert("flux".to_string(), far);
        assert!(matches!(proposals(&config).unwrap()[0].1, Proposal::Weighted { .. }));
        config.priors.insert("flux".to_string(), Prior::Normal { mean: 2.5, std: 0.2 });
        assert!(matches!(proposals(&config).unwrap()[0].1, Proposal::Truncated { .. }));
    }

    #[test]
    fn checkpoint_payload_carries_every_draw() {
        let sampler = PriorSampler::new(Arc::new(ConstantSpectrum::new(1.0)));
        let config = flux_configuration();
        let ds = dataset();
        let settings = settings();
        let mut session = sampler
            .begin(
                SamplingJob {
                    configuration: &config,
                    dataset: &ds,
                    settings: &settings,
                },
                None,
            )
            .unwrap();
        session.step().unwrap();
        session.step().unwrap();
        let payload = session.checkpoint_payload().unwrap();
        let expected = session.iteration() as usize * settings.live_points;
        assert!(expected > 0);
        assert_eq!(payload["draws"].as_array().unwrap().len(), expected);
    }

    #[test]
    fn forward_model_failure_fails_the_step() {
        let sampler = PriorSampler::new(Arc::new(crate::engine::Blackbody::new(1.0)));
        let config = flux_configuration();
        let ds = dataset();
        let settings = settings();
        let mut session = sampler
            .begin(
                SamplingJob {
                    configuration: &config,
                    dataset: &ds,
                    settings: &settings,
                },
                None,
            )
            .unwrap();
        assert!(matches!(session.step(), Err(HarnessError::ForwardModel(_))));
    }
}
