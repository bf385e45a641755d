//! Harness configuration.
//!
//! Resolution order, lowest to highest precedence:
//!
//! 1. built-in defaults
//! 2. the TOML file (`--config`, or `harness.toml` in the working directory)
//! 3. environment (`RETRIEVAL_STORE_DIR`, after loading `.env`)
//! 4. CLI flags, applied by the caller

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::derive::DerivedSettings;
use crate::domain::SamplerSettings;
use crate::engine::{Blackbody, ConstantSpectrum, ExternalForwardModel, ExternalSampler, ForwardModel, PriorSampler, Sampler};
use crate::error::{HarnessError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "harness.toml";
pub const STORE_DIR_ENV: &str = "RETRIEVAL_STORE_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub store_dir: PathBuf,
    /// Root for figures, report JSON and residual exports.
    pub output_dir: PathBuf,
    /// Concurrent runs.
    pub workers: usize,
    pub sampler: SamplerSettings,
    pub derived: DerivedSettings,
    pub engine: EngineConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("retrievals"),
            output_dir: PathBuf::from("figures"),
            workers: 1,
            sampler: SamplerSettings::default(),
            derived: DerivedSettings::default(),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Built-in prior-importance sampler over a built-in forward model.
    #[default]
    Synthetic,
    /// Out-of-process sampler and forward model.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinModel {
    #[default]
    Blackbody,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Sampling command for `kind = "external"`.
    pub command: Vec<String>,
    /// Forward-model command for `kind = "external"`.
    pub forward_command: Vec<String>,
    /// Forward model for `kind = "synthetic"`.
    pub model: BuiltinModel,
    pub poll_interval_ms: u64,
    /// Engine working directories live here, one folder per configuration.
    pub work_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Synthetic,
            command: Vec::new(),
            forward_command: Vec::new(),
            model: BuiltinModel::Blackbody,
            poll_interval_ms: 1000,
            work_dir: PathBuf::from("."),
        }
    }
}

impl HarnessConfig {
    /// Load from `path`, or from `harness.toml` when present, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        if let Ok(dir) = std::env::var(STORE_DIR_ENV) {
            if !dir.trim().is_empty() {
                debug!(store_dir = %dir, "store directory overridden from environment");
                config.store_dir = PathBuf::from(dir);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        Self::parse(&text).map_err(|e| match e {
            HarnessError::Config(msg) => HarnessError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| HarnessError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(HarnessError::InvalidSettings(
                "workers must be a positive integer".to_string(),
            ));
        }
        self.sampler.validate()?;
        self.derived.validate()?;
        if self.engine.kind == EngineKind::External && self.engine.command.is_empty() {
            return Err(HarnessError::Config(
                "engine.kind = \"external\" requires engine.command".to_string(),
            ));
        }
        Ok(())
    }

    /// Forward model used for derived quantities and by the built-in sampler.
    ///
    /// `distance_m` feeds the blackbody dilution factor.
    pub fn forward_model(&self, distance_m: f64) -> Result<Arc<dyn ForwardModel>> {
        match self.engine.kind {
            EngineKind::External => {
                if self.engine.forward_command.is_empty() {
                    return Err(HarnessError::Config(
                        "engine.kind = \"external\" requires engine.forward_command for derived quantities"
                            .to_string(),
                    ));
                }
                Ok(Arc::new(ExternalForwardModel::new(
                    self.engine.forward_command.clone(),
                    self.engine.work_dir.join("forward"),
                )?))
            }
            EngineKind::Synthetic => Ok(match self.engine.model {
                BuiltinModel::Blackbody => Arc::new(Blackbody::new(distance_m)),
                BuiltinModel::Constant => Arc::new(ConstantSpectrum::new(1.0)),
            }),
        }
    }

    pub fn sampler(&self, distance_m: f64) -> Result<Arc<dyn Sampler>> {
        match self.engine.kind {
            EngineKind::External => Ok(Arc::new(ExternalSampler::new(
                self.engine.command.clone(),
                self.engine.work_dir.clone(),
                Duration::from_millis(self.engine.poll_interval_ms),
            )?)),
            EngineKind::Synthetic => Ok(Arc::new(PriorSampler::new(self.forward_model(distance_m)?))),
        }
    }
}
