//! Adapters for an engine that runs as a separate process.
//!
//! Protocol: the harness writes a JSON job file and spawns the configured
//! command with the job path appended as the last argument.
//!
//! Sampling job (`<work>/<output_folder>/job.json`):
//!
//! ```json
//! { "tag": "...", "configuration": {...}, "dataset": {...}, "settings": {...},
//!   "resume_checkpoint": "<path or null>",
//!   "checkpoint_path": "<engine may write resumable state here>",
//!   "result_path": "<engine writes {samples, diagnostics} here>" }
//! ```
//!
//! The process is polled between iterations; its exit status decides success.
//! Forward-model requests follow the same pattern with a batch of parameter
//! vectors and a wavelength grid, answered by `{ "fluxes": [[...], ...] }`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{Checkpoint, Configuration, Dataset, ParamVector, SamplerSettings, Tag};
use crate::engine::{ForwardModel, Posterior, Sampler, SamplerSession, SamplingJob, StepOutcome};
use crate::error::{HarnessError, Result};
use crate::store::write_json_atomic;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize)]
struct JobFile<'a> {
    tag: &'a Tag,
    configuration: &'a Configuration,
    dataset: &'a Dataset,
    settings: &'a SamplerSettings,
    resume_checkpoint: Option<PathBuf>,
    checkpoint_path: PathBuf,
    result_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExternalCheckpoint {
    /// Whatever the engine left at `checkpoint_path`, verbatim.
    engine_state: serde_json::Value,
    polls: u64,
}

#[derive(Debug, Clone)]
pub struct ExternalSampler {
    command: Vec<String>,
    work_root: PathBuf,
    poll_interval: Duration,
}

impl ExternalSampler {
    pub fn new(command: Vec<String>, work_root: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self> {
        if command.is_empty() {
            return Err(HarnessError::Config(
                "external engine command is empty".to_string(),
            ));
        }
        Ok(Self {
            command,
            work_root: work_root.into(),
            poll_interval,
        })
    }
}

impl Sampler for ExternalSampler {
    fn name(&self) -> &str {
        "external"
    }

    fn begin(
        &self,
        job: SamplingJob<'_>,
        resume_from: Option<&Checkpoint>,
    ) -> Result<Box<dyn SamplerSession>> {
        let tag = &job.configuration.tag;
        let folder = self.work_root.join(job.configuration.output_folder());
        fs::create_dir_all(&folder).map_err(|e| HarnessError::io(&folder, e))?;

        let checkpoint_path = folder.join("checkpoint.json");
        let result_path = folder.join("result.json");
        // A stale result from an earlier run must not be mistaken for this one.
        if result_path.exists() {
            fs::remove_file(&result_path).map_err(|e| HarnessError::io(&result_path, e))?;
        }

        let mut polls = 0;
        let resume_checkpoint = match resume_from {
            Some(checkpoint) => {
                let restored: ExternalCheckpoint = serde_json::from_value(checkpoint.payload.clone())
                    .map_err(|e| HarnessError::Sampler {
                        tag: tag.to_string(),
                        cause: format!("unreadable checkpoint: {e}"),
                    })?;
                polls = restored.polls;
                let path = folder.join("resume.json");
                write_json_atomic(&path, &restored.engine_state)?;
                Some(path)
            }
            None => None,
        };

        let job_path = folder.join("job.json");
        write_json_atomic(
            &job_path,
            &JobFile {
                tag,
                configuration: job.configuration,
                dataset: job.dataset,
                settings: job.settings,
                resume_checkpoint,
                checkpoint_path: checkpoint_path.clone(),
                result_path: result_path.clone(),
            },
        )?;

        let child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .arg(&job_path)
            .current_dir(&folder)
            .spawn()
            .map_err(|e| HarnessError::Sampler {
                tag: tag.to_string(),
                cause: format!("failed to spawn '{}': {e}", self.command[0]),
            })?;
        info!(tag = %tag, pid = child.id(), job = %job_path.display(), "external engine started");

        Ok(Box::new(ExternalSession {
            tag: tag.clone(),
            child: Some(child),
            poll_interval: self.poll_interval,
            polls,
            checkpoint_path,
            result_path,
        }))
    }
}

struct ExternalSession {
    tag: Tag,
    child: Option<Child>,
    poll_interval: Duration,
    polls: u64,
    checkpoint_path: PathBuf,
    result_path: PathBuf,
}

impl ExternalSession {
    fn sampler_error(&self, cause: impl Into<String>) -> HarnessError {
        HarnessError::Sampler {
            tag: self.tag.to_string(),
            cause: cause.into(),
        }
    }

    fn read_posterior(&self) -> Result<Posterior> {
        let bytes = fs::read(&self.result_path).map_err(|e| {
            self.sampler_error(format!(
                "engine produced no result at '{}': {e}",
                self.result_path.display()
            ))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| self.sampler_error(format!("engine result is malformed: {e}")))
    }
}

impl SamplerSession for ExternalSession {
    fn iteration(&self) -> u64 {
        self.polls
    }

    fn step(&mut self) -> Result<StepOutcome> {
        let Some(child) = self.child.as_mut() else {
            return Ok(StepOutcome::Converged);
        };
        let status = child
            .try_wait()
            .map_err(|e| HarnessError::io(&self.result_path, e))?;

        match status {
            Some(status) => {
                self.child = None;
                if status.success() {
                    debug!(tag = %self.tag, polls = self.polls, "external engine finished");
                    Ok(StepOutcome::Converged)
                } else {
                    Err(self.sampler_error(format!("engine exited with {status}")))
                }
            }
            None => {
                thread::sleep(self.poll_interval);
                self.polls += 1;
                Ok(StepOutcome::Continue {
                    iteration: self.polls,
                })
            }
        }
    }

    fn checkpoint_payload(&self) -> Result<serde_json::Value> {
        let engine_state = match fs::read(&self.checkpoint_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::Value::Null,
            Err(e) => return Err(HarnessError::io(&self.checkpoint_path, e)),
        };
        Ok(serde_json::to_value(ExternalCheckpoint {
            engine_state,
            polls: self.polls,
        })?)
    }

    fn finish(self: Box<Self>) -> Result<Posterior> {
        self.read_posterior()
    }

    fn partial(&self) -> Option<Posterior> {
        self.read_posterior().ok()
    }

    fn abort(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                warn!(tag = %self.tag, error = %e, "failed to stop external engine");
            }
            let _ = child.wait();
        }
    }
}

impl Drop for ExternalSession {
    fn drop(&mut self) {
        self.abort();
    }
}

#[derive(Debug, Serialize)]
struct ForwardRequest<'a> {
    parameters: &'a [ParamVector],
    wavelengths: &'a [f64],
    response_path: &'a Path,
}

#[derive(Debug, Deserialize)]
struct ForwardResponse {
    fluxes: Vec<Vec<f64>>,
}

/// Request/response pair of one forward-model call, removed on drop.
struct RequestFiles {
    request: PathBuf,
    response: PathBuf,
}

impl Drop for RequestFiles {
    fn drop(&mut self) {
        for path in [&self.request, &self.response] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "could not remove forward-model file");
                }
            }
        }
    }
}

/// Forward model served by an external command, one process per batch.
#[derive(Debug, Clone)]
pub struct ExternalForwardModel {
    command: Vec<String>,
    work_dir: PathBuf,
}

impl ExternalForwardModel {
    pub fn new(command: Vec<String>, work_dir: impl Into<PathBuf>) -> Result<Self> {
        if command.is_empty() {
            return Err(HarnessError::Config(
                "external forward-model command is empty".to_string(),
            ));
        }
        Ok(Self {
            command,
            work_dir: work_dir.into(),
        })
    }
}

impl ForwardModel for ExternalForwardModel {
    fn name(&self) -> &str {
        "external"
    }

    fn spectrum(&self, params: &ParamVector, wavelengths: &[f64]) -> Result<Vec<f64>> {
        let mut fluxes = self.spectra(std::slice::from_ref(params), wavelengths)?;
        fluxes
            .pop()
            .ok_or_else(|| HarnessError::ForwardModel("engine returned no spectrum".to_string()))
    }

    fn spectra(&self, params: &[ParamVector], wavelengths: &[f64]) -> Result<Vec<Vec<f64>>> {
        fs::create_dir_all(&self.work_dir).map_err(|e| HarnessError::io(&self.work_dir, e))?;
        let id = format!(
            "{}-{}",
            std::process::id(),
            REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let files = RequestFiles {
            request: self.work_dir.join(format!("forward-{id}.json")),
            response: self.work_dir.join(format!("forward-{id}.out.json")),
        };

        write_json_atomic(
            &files.request,
            &ForwardRequest {
                parameters: params,
                wavelengths,
                response_path: &files.response,
            },
        )?;

        let status = Command::new(&self.command[0])
            .args(&self.command[1..])
            .arg(&files.request)
            .status()
            .map_err(|e| HarnessError::ForwardModel(format!("failed to run '{}': {e}", self.command[0])))?;
        if !status.success() {
            return Err(HarnessError::ForwardModel(format!(
                "forward model exited with {status}"
            )));
        }

        let bytes = fs::read(&files.response).map_err(|e| HarnessError::io(&files.response, e))?;
        let response: ForwardResponse = serde_json::from_slice(&bytes)
            .map_err(|e| HarnessError::ForwardModel(format!("malformed forward-model response: {e}")))?;
        Ok(response.fluxes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{configuration, dataset};
    use tempfile::TempDir;

    #[test]
    fn empty_command_is_a_config_error() {
        assert!(matches!(
            ExternalSampler::new(Vec::new(), "work", Duration::from_millis(10)),
            Err(HarnessError::Config(_))
        ));
        assert!(matches!(
            ExternalForwardModel::new(Vec::new(), "work"),
            Err(HarnessError::Config(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn malformed_forward_response_leaves_no_files_behind() {
        let dir = TempDir::new().unwrap();
        let model = ExternalForwardModel::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"echo nope > "${1%.json}.out.json""#.to_string(),
                "forward".to_string(),
            ],
            dir.path(),
        )
        .unwrap();

        let err = model.spectrum(&ParamVector::new(), &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, HarnessError::ForwardModel(ref msg) if msg.contains("malformed")));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn silent_forward_engine_leaves_no_files_behind() {
        let dir = TempDir::new().unwrap();
        let model = ExternalForwardModel::new(
            vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string(), "forward".to_string()],
            dir.path(),
        )
        .unwrap();

        assert!(matches!(
            model.spectrum(&ParamVector::new(), &[1.0]),
            Err(HarnessError::Io { .. })
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn failing_engine_reports_sampler_error() {
        let dir = TempDir::new().unwrap();
        let sampler = ExternalSampler::new(
            vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string(), "engine".to_string()],
            dir.path(),
            Duration::from_millis(5),
        )
        .unwrap();
        let config = configuration("ext");
        let ds = dataset();
        let settings = SamplerSettings::default();
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

        assert!(dir.path().join("ext-multinest/job.json").is_file());
        let outcome = loop {
            match session.step() {
                Ok(StepOutcome::Continue { .. }) => continue,
                other => break other,
            }
        };
        assert!(matches!(outcome, Err(HarnessError::Sampler { .. })));
    }
}
