//! Configuration-side domain types.
//!
//! Plain serializable values that are:
//!
//! - declared in TOML manifests
//! - embedded in stored results (as a snapshot of what was run)
//! - forwarded verbatim to an external engine as part of a job file

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// Parameter name → value. Ordered so serialized output is stable.
pub type ParamVector = BTreeMap<String, f64>;

/// Unique identifier for one configuration / run / result triple.
///
/// Tags double as file and directory names, so they are restricted to
/// `[A-Za-z0-9._-]` and may not be `.` or `..`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(HarnessError::InvalidTag {
                tag: raw,
                reason: "tag is empty".to_string(),
            });
        }
        if raw == "." || raw == ".." {
            return Err(HarnessError::InvalidTag {
                tag: raw,
                reason: "tag may not be a relative path component".to_string(),
            });
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(HarnessError::InvalidTag {
                reason: format!("character {bad:?} is not allowed"),
                tag: raw,
            });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Tag {
    type Error = HarnessError;

    fn try_from(value: String) -> Result<Self> {
        Tag::new(value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

impl Borrow<str> for Tag {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed parameter interval `[lower, upper]`.
///
/// Serialized as a two-element array (`logg = [2.5, 6.0]`). Ordering is
/// checked at registration time, not at deserialization time, so a bad
/// manifest entry surfaces as `InvalidBounds` with the offending tag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn is_valid(&self) -> bool {
        self.lower.is_finite() && self.upper.is_finite() && self.lower <= self.upper
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

impl From<(f64, f64)> for Interval {
    fn from((lower, upper): (f64, f64)) -> Self {
        Self { lower, upper }
    }
}

impl From<Interval> for (f64, f64) {
    fn from(value: Interval) -> Self {
        (value.lower, value.upper)
    }
}

/// Informative prior on a parameter (or on a derived quantity such as `mass`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "lowercase")]
pub enum Prior {
    Normal { mean: f64, std: f64 },
}

impl Prior {
    pub fn is_valid(&self) -> bool {
        match *self {
            Prior::Normal { mean, std } => mean.is_finite() && std.is_finite() && std > 0.0,
        }
    }

    /// Log probability density at `x`.
    pub fn ln_density(&self, x: f64) -> f64 {
        match *self {
            Prior::Normal { mean, std } => {
                let z = (x - mean) / std;
                -0.5 * z * z - std.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln()
            }
        }
    }
}

/// Pressure grid used by the radiative-transfer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PressureGrid {
    Standard,
    Smaller,
    /// Adaptive refinement around the cloud decks.
    Clouds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Chemistry {
    Equilibrium,
    Free,
}

/// Pressure–temperature profile family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PtProfile {
    Molliere,
    Free,
    Monotonic,
    Eddington,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Quenching {
    None,
    Pressure,
    Diffusion,
}

/// Physical-model switches forwarded to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelToggles {
    pub line_species: Vec<String>,
    pub cloud_species: Vec<String>,
    /// Scattering only makes sense with clouds.
    pub scattering: bool,
    pub pressure_grid: PressureGrid,
    pub chemistry: Chemistry,
    pub pt_profile: PtProfile,
    pub quenching: Quenching,
    /// Wavelength range (µm) of the spectra included in the fit.
    pub wavel_range: (f64, f64),
    /// Spectrum instruments included in the likelihood.
    pub inc_spec: Vec<String>,
    pub inc_phot: bool,
    /// Instruments fitted with a correlated-noise model.
    pub fit_corr: Vec<String>,
    pub pt_smooth: f64,
}

impl Default for ModelToggles {
    fn default() -> Self {
        Self {
            line_species: Vec::new(),
            cloud_species: Vec::new(),
            scattering: false,
            pressure_grid: PressureGrid::Standard,
            chemistry: Chemistry::Equilibrium,
            pt_profile: PtProfile::Molliere,
            quenching: Quenching::None,
            wavel_range: (0.9, 3.0),
            inc_spec: Vec::new(),
            inc_phot: true,
            fit_corr: Vec::new(),
            pt_smooth: 0.0,
        }
    }
}

/// One named retrieval configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub tag: Tag,
    pub bounds: BTreeMap<String, Interval>,
    #[serde(default)]
    pub priors: BTreeMap<String, Prior>,
    #[serde(default)]
    pub toggles: ModelToggles,
    /// Engine working directory; defaults to `<tag>-multinest`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_folder: Option<String>,
}

impl Configuration {
    pub fn new(
        tag: Tag,
        bounds: BTreeMap<String, Interval>,
        priors: BTreeMap<String, Prior>,
        toggles: ModelToggles,
    ) -> Self {
        Self {
            tag,
            bounds,
            priors,
            toggles,
            output_folder: None,
        }
    }

    pub fn output_folder(&self) -> String {
        self.output_folder
            .clone()
            .unwrap_or_else(|| format!("{}-multinest", self.tag))
    }

    /// Sampled parameter names (bounded parameters), in sorted order.
    pub fn parameter_names(&self) -> Vec<&str> {
        self.bounds.keys().map(String::as_str).collect()
    }

    /// True when both configurations would drive the engine identically.
    pub fn same_model_as(&self, other: &Configuration) -> bool {
        self.bounds == other.bounds && self.priors == other.priors && self.toggles == other.toggles
    }
}

/// Settings for a single sampling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    pub live_points: usize,
    /// Continue from an existing checkpoint for the tag instead of restarting.
    pub resume: bool,
    /// Forwarded to the engine; the harness itself never plots during a run.
    pub plotting: bool,
    /// Store the partial posterior when the sampler fails.
    pub write_partial_on_failure: bool,
    /// Write a checkpoint every N iterations (0 disables periodic checkpoints).
    /// The built-in sampler's checkpoint holds every draw so far, so its size
    /// grows as `live_points * iteration`.
    pub checkpoint_every: u64,
    pub seed: u64,
    /// Hard cap on sampler iterations.
    pub max_iterations: u64,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            live_points: 1000,
            resume: true,
            plotting: false,
            write_partial_on_failure: false,
            checkpoint_every: 50,
            seed: 42,
            max_iterations: 200,
        }
    }
}

impl SamplerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.live_points == 0 {
            return Err(HarnessError::InvalidSettings(
                "live_points must be a positive integer".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(HarnessError::InvalidSettings(
                "max_iterations must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

/// Final status of a stored result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Completed,
    ResumedCompleted,
    Failed,
}

impl RunStatus {
    pub fn label(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::ResumedCompleted => "resumed-completed",
            RunStatus::Failed => "failed",
        }
    }
}
