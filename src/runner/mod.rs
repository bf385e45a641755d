//! Runs configurations against the dataset and persists their results.
//!
//! A run drives a [`SamplerSession`] one iteration at a time. Between
//! iterations it checks the cancel token and writes periodic checkpoints.
//! Outcomes:
//!
//! - converged: the result is stored under the tag and the checkpoint removed
//! - sampler failure: nothing is stored unless `write_partial_on_failure`
//! - cancelled: a checkpoint is stored, no result
//!
//! `run_all` fans configurations out over a rayon pool. A failing run never
//! aborts its siblings.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::{
    Checkpoint, Configuration, Dataset, RetrievalResult, RunStatus, SamplerSettings, Tag,
};
use crate::engine::{Posterior, Sampler, SamplerSession, SamplingJob, StepOutcome};
use crate::error::{HarnessError, Result};
use crate::registry::validate_configuration;
use crate::store::ResultStore;

/// Cooperative cancellation shared by every run of a batch.
///
/// Optionally bound to a stop file: creating that file cancels all runs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    stop_file: Option<Arc<PathBuf>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop_file(path: impl Into<PathBuf>) -> Self {
        Self {
            flag: Arc::default(),
            stop_file: Some(Arc::new(path.into())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(path) = &self.stop_file {
            if path.exists() {
                info!(stop_file = %path.display(), "stop file found; cancelling runs");
                self.cancel();
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum RunOutcome {
    Completed,
    ResumedCompleted,
    Failed { cause: String, partial_stored: bool },
    Cancelled,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::ResumedCompleted => "resumed-completed",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

/// What happened to one configuration.
#[derive(Debug, Clone, Serialize)]
pub struct RunHandle {
    pub tag: Tag,
    pub outcome: RunOutcome,
    /// Sampler iterations at the end of the run, including resumed ones.
    pub iterations: u64,
    pub elapsed: Duration,
}

impl RunHandle {
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            RunOutcome::Completed | RunOutcome::ResumedCompleted
        )
    }
}

#[derive(Clone)]
pub struct RetrievalRunner {
    store: ResultStore,
    sampler: Arc<dyn Sampler>,
}

impl RetrievalRunner {
    pub fn new(store: ResultStore, sampler: Arc<dyn Sampler>) -> Self {
        Self { store, sampler }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Run one configuration to convergence, failure or cancellation.
    ///
    /// Returns `Err` only for invalid inputs or store failures; sampler
    /// failures are reported through the handle.
    pub fn run(
        &self,
        configuration: &Configuration,
        dataset: &Dataset,
        settings: &SamplerSettings,
        cancel: &CancelToken,
    ) -> Result<RunHandle> {
        settings.validate()?;
        validate_configuration(configuration)?;
        dataset.validate()?;

        let tag = &configuration.tag;
        let clock = Instant::now();
        let started_at = Utc::now();

        let checkpoint = self.resume_point(tag, settings)?;
        let resumed = checkpoint.is_some();
        let job = SamplingJob {
            configuration,
            dataset,
            settings,
        };

        info!(
            tag = %tag,
            engine = self.sampler.name(),
            live_points = settings.live_points,
            resumed,
            "run started"
        );

        let mut session = match self.sampler.begin(job, checkpoint.as_ref()) {
            Ok(session) => session,
            Err(err) => return Ok(self.failed(tag, None, err, 0, clock, started_at, configuration)),
        };

        loop {
            if cancel.is_cancelled() {
                self.write_checkpoint(tag, session.as_ref())?;
                session.abort();
                warn!(tag = %tag, iteration = session.iteration(), "run cancelled; checkpoint kept");
                return Ok(RunHandle {
                    tag: tag.clone(),
                    outcome: RunOutcome::Cancelled,
                    iterations: session.iteration(),
                    elapsed: clock.elapsed(),
                });
            }

            match session.step() {
                Ok(StepOutcome::Continue { iteration }) => {
                    if settings.checkpoint_every > 0 && iteration % settings.checkpoint_every == 0 {
                        self.write_checkpoint(tag, session.as_ref())?;
                    }
                }
                Ok(StepOutcome::Converged) => break,
                Err(err) => {
                    let iterations = session.iteration();
                    let partial = settings
                        .write_partial_on_failure
                        .then(|| session.partial())
                        .flatten();
                    return Ok(self.failed(tag, partial, err, iterations, clock, started_at, configuration));
                }
            }
        }

        let iterations = session.iteration();
        let posterior = match session.finish().and_then(|p| p.ensure_finite(tag.as_str()).map(|()| p)) {
            Ok(posterior) => posterior,
            Err(err) => return Ok(self.failed(tag, None, err, iterations, clock, started_at, configuration)),
        };

        let status = if resumed {
            RunStatus::ResumedCompleted
        } else {
            RunStatus::Completed
        };
        let result = self.build_result(configuration, status, posterior, started_at);
        self.store.put(&result)?;
        self.store.delete_checkpoint(tag)?;

        info!(
            tag = %tag,
            status = status.label(),
            samples = result.samples.len(),
            log_evidence = result.diagnostics.log_evidence,
            iterations,
            "run completed"
        );

        Ok(RunHandle {
            tag: tag.clone(),
            outcome: if resumed {
                RunOutcome::ResumedCompleted
            } else {
                RunOutcome::Completed
            },
            iterations,
            elapsed: clock.elapsed(),
        })
    }

    /// Run many configurations, one per worker. Handles come back in input order.
    pub fn run_all(
        &self,
        configurations: &[Configuration],
        dataset: &Dataset,
        settings: &SamplerSettings,
        workers: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<RunHandle>> {
        settings.validate()?;
        let mut seen = HashSet::new();
        for c in configurations {
            if !seen.insert(&c.tag) {
                return Err(HarnessError::DuplicateTag(c.tag.to_string()));
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("retrieval-worker-{i}"))
            .build()
            .map_err(|e| HarnessError::Config(format!("failed to start worker pool: {e}")))?;

        info!(runs = configurations.len(), workers = workers.max(1), "batch started");
        let handles: Vec<RunHandle> = pool.install(|| {
            configurations
                .par_iter()
                .map(|c| {
                    let clock = Instant::now();
                    self.run(c, dataset, settings, cancel).unwrap_or_else(|err| {
                        error!(tag = %c.tag, error = %err, "run aborted");
                        RunHandle {
                            tag: c.tag.clone(),
                            outcome: RunOutcome::Failed {
                                cause: err.to_string(),
                                partial_stored: false,
                            },
                            iterations: 0,
                            elapsed: clock.elapsed(),
                        }
                    })
                })
                .collect()
        });

        let succeeded = handles.iter().filter(|h| h.is_success()).count();
        info!(succeeded, total = handles.len(), "batch finished");
        Ok(handles)
    }

    fn resume_point(&self, tag: &Tag, settings: &SamplerSettings) -> Result<Option<Checkpoint>> {
        let existing = self.store.get_checkpoint(tag)?;
        match existing {
            Some(checkpoint) if settings.resume && checkpoint.engine == self.sampler.name() => {
                info!(tag = %tag, iteration = checkpoint.iteration, "resuming from checkpoint");
                Ok(Some(checkpoint))
            }
            Some(checkpoint) => {
                if settings.resume {
                    warn!(
                        tag = %tag,
                        written_by = %checkpoint.engine,
                        engine = self.sampler.name(),
                        "checkpoint belongs to another engine; starting fresh"
                    );
                } else {
                    info!(tag = %tag, "resume disabled; discarding stale checkpoint");
                }
                self.store.delete_checkpoint(tag)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn write_checkpoint(&self, tag: &Tag, session: &dyn SamplerSession) -> Result<()> {
        let checkpoint = Checkpoint {
            tag: tag.clone(),
            engine: self.sampler.name().to_string(),
            iteration: session.iteration(),
            payload: session.checkpoint_payload()?,
            updated_at: Utc::now(),
        };
        self.store.put_checkpoint(&checkpoint)
    }

    fn build_result(
        &self,
        configuration: &Configuration,
        status: RunStatus,
        posterior: Posterior,
        started_at: chrono::DateTime<Utc>,
    ) -> RetrievalResult {
        RetrievalResult {
            tag: configuration.tag.clone(),
            engine: self.sampler.name().to_string(),
            configuration: configuration.clone(),
            status,
            samples: posterior.samples,
            diagnostics: posterior.diagnostics,
            started_at,
            completed_at: Utc::now(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn failed(
        &self,
        tag: &Tag,
        partial: Option<Posterior>,
        err: HarnessError,
        iterations: u64,
        clock: Instant,
        started_at: chrono::DateTime<Utc>,
        configuration: &Configuration,
    ) -> RunHandle {
        let cause = err.to_string();
        error!(tag = %tag, error = %cause, iterations, "run failed");

        let partial_stored = match partial.filter(|p| p.ensure_finite(tag.as_str()).is_ok()) {
            Some(posterior) => {
                let result = self.build_result(configuration, RunStatus::Failed, posterior, started_at);
                match self.store.put(&result) {
                    Ok(()) => {
                        warn!(tag = %tag, samples = result.samples.len(), "partial posterior stored");
                        true
                    }
                    Err(store_err) => {
                        error!(tag = %tag, error = %store_err, "could not store partial posterior");
                        false
                    }
                }
            }
            None => false,
        };

        RunHandle {
            tag: tag.clone(),
            outcome: RunOutcome::Failed {
                cause,
                partial_stored,
            },
            iterations,
            elapsed: clock.elapsed(),
        }
    }
}
