//! Run outputs: stored results and resumable checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Configuration, ParamVector, RunStatus, Tag};

/// One posterior sample as reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSample {
    pub params: ParamVector,
    pub log_likelihood: f64,
    #[serde(default)]
    pub log_prior: f64,
    /// Posterior weight; equal-weight samples carry `1.0`.
    #[serde(default = "unit_weight")]
    pub weight: f64,
}

fn unit_weight() -> f64 {
    1.0
}

impl PosteriorSample {
    pub fn log_posterior(&self) -> f64 {
        self.log_likelihood + self.log_prior
    }
}

/// Sampling diagnostics reported alongside the samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub log_evidence: f64,
    pub log_evidence_err: f64,
    pub live_points: usize,
    pub iterations: u64,
    pub converged: bool,
}

/// A retrieval result persisted under its configuration's tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub tag: Tag,
    /// Name of the engine that produced the samples.
    pub engine: String,
    /// Snapshot of the configuration that was run.
    pub configuration: Configuration,
    pub status: RunStatus,
    /// Index → sample, in engine order.
    pub samples: Vec<PosteriorSample>,
    pub diagnostics: Diagnostics,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RetrievalResult {
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Partial sampler state kept between process lifetimes.
///
/// The payload is opaque to the harness; only the engine that wrote it can
/// interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub tag: Tag,
    pub engine: String,
    pub iteration: u64,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}
