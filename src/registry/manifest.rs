//! Data-driven configuration sets (TOML).
//!
//! A manifest holds one `[defaults]` table and any number of
//! `[[configuration]]` records. Each record is merged over the defaults, so a
//! family of retrievals that differ only in a prior or two is written once:
//!
//! ```toml
//! [defaults]
//! cloud_species = ["MgSiO3(c)_cd", "Fe(c)_cd"]
//! scattering = true
//!
//! [defaults.bounds]
//! logg = [2.5, 6.0]
//! radius = [0.5, 2.0]
//!
//! [[configuration]]
//! tag = "HD72946B-am-molliere-nomass-freeab"
//!
//! [[configuration]]
//! tag = "HD72946B-am-molliere-mass-freeab"
//! priors = { mass = [69.5, 0.5] }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::domain::{
    Chemistry, Configuration, Interval, ModelToggles, Prior, PressureGrid, PtProfile, Quenching, Tag,
};
use crate::error::{HarnessError, Result};
use crate::registry::{ConfigurationRegistry, RegistrationReport};

/// Prior as written in a manifest: `[mean, std]` or a full table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PriorRecord {
    Pair((f64, f64)),
    Full(Prior),
}

impl From<PriorRecord> for Prior {
    fn from(record: PriorRecord) -> Self {
        match record {
            PriorRecord::Pair((mean, std)) => Prior::Normal { mean, std },
            PriorRecord::Full(prior) => prior,
        }
    }
}

/// Toggle fields that a record may override. Unset fields inherit.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToggleOverrides {
    pub line_species: Option<Vec<String>>,
    pub cloud_species: Option<Vec<String>>,
    pub scattering: Option<bool>,
    pub pressure_grid: Option<PressureGrid>,
    pub chemistry: Option<Chemistry>,
    pub pt_profile: Option<PtProfile>,
    pub quenching: Option<Quenching>,
    pub wavel_range: Option<(f64, f64)>,
    pub inc_spec: Option<Vec<String>>,
    pub inc_phot: Option<bool>,
    pub fit_corr: Option<Vec<String>>,
    pub pt_smooth: Option<f64>,
}

impl ToggleOverrides {
    fn apply(&self, base: &mut ModelToggles) {
        if let Some(v) = &self.line_species {
            base.line_species = v.clone();
        }
        if let Some(v) = &self.cloud_species {
            base.cloud_species = v.clone();
        }
        if let Some(v) = self.scattering {
            base.scattering = v;
        }
        if let Some(v) = self.pressure_grid {
            base.pressure_grid = v;
        }
        if let Some(v) = self.chemistry {
            base.chemistry = v;
        }
        if let Some(v) = self.pt_profile {
            base.pt_profile = v;
        }
        if let Some(v) = self.quenching {
            base.quenching = v;
        }
        if let Some(v) = self.wavel_range {
            base.wavel_range = v;
        }
        if let Some(v) = &self.inc_spec {
            base.inc_spec = v.clone();
        }
        if let Some(v) = self.inc_phot {
            base.inc_phot = v;
        }
        if let Some(v) = &self.fit_corr {
            base.fit_corr = v.clone();
        }
        if let Some(v) = self.pt_smooth {
            base.pt_smooth = v;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsRecord {
    #[serde(default)]
    pub bounds: BTreeMap<String, Interval>,
    #[serde(default)]
    pub priors: BTreeMap<String, PriorRecord>,
    #[serde(flatten)]
    pub toggles: ToggleOverrides,
    /// Keys matching no field; rejected by `ConfigurationManifest::parse`.
    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigurationRecord {
    pub tag: String,
    #[serde(default)]
    pub output_folder: Option<String>,
    /// Added to, or replacing, the default bounds.
    #[serde(default)]
    pub bounds: BTreeMap<String, Interval>,
    /// Default bounds to drop for this record.
    #[serde(default)]
    pub remove_bounds: Vec<String>,
    #[serde(default)]
    pub priors: BTreeMap<String, PriorRecord>,
    #[serde(flatten)]
    pub toggles: ToggleOverrides,
    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigurationManifest {
    #[serde(default)]
    pub defaults: DefaultsRecord,
    #[serde(default, rename = "configuration")]
    pub records: Vec<ConfigurationRecord>,
}

impl ConfigurationManifest {
    pub fn parse(text: &str) -> Result<Self> {
        let manifest: Self =
            toml::from_str(text).map_err(|e| HarnessError::Config(format!("invalid manifest: {e}")))?;

        // `deny_unknown_fields` does not reach through `flatten`, so misspelt
        // toggles are caught here.
        if let Some(key) = manifest.defaults.unknown.keys().next() {
            return Err(HarnessError::Config(format!(
                "invalid manifest: unknown field `{key}` in [defaults]"
            )));
        }
        for record in &manifest.records {
            if let Some(key) = record.unknown.keys().next() {
                return Err(HarnessError::Config(format!(
                    "invalid manifest: unknown field `{key}` in configuration '{}'",
                    record.tag
                )));
            }
        }
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        Self::parse(&text).map_err(|e| match e {
            HarnessError::Config(msg) => HarnessError::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Merge every record over the defaults, in file order.
    ///
    /// Each entry carries the raw tag so a failed record can still be reported.
    pub fn configurations(&self) -> Vec<(String, Result<Configuration>)> {
        self.records
            .iter()
            .map(|record| (record.tag.clone(), self.merge(record)))
            .collect()
    }

    fn merge(&self, record: &ConfigurationRecord) -> Result<Configuration> {
        let tag = Tag::new(record.tag.clone())?;

        let mut toggles = ModelToggles::default();
        self.defaults.toggles.apply(&mut toggles);
        record.toggles.apply(&mut toggles);

        let mut bounds = self.defaults.bounds.clone();
        for name in &record.remove_bounds {
            bounds.remove(name);
        }
        bounds.extend(record.bounds.iter().map(|(k, v)| (k.clone(), *v)));

        let mut priors: BTreeMap<String, Prior> = self
            .defaults
            .priors
            .iter()
            .map(|(k, v)| (k.clone(), v.clone().into()))
            .collect();
        priors.extend(record.priors.iter().map(|(k, v)| (k.clone(), v.clone().into())));

        Ok(Configuration {
            tag,
            bounds,
            priors,
            toggles,
            output_folder: record.output_folder.clone(),
        })
    }
}

impl ConfigurationRegistry {
    /// Register every record of a manifest; bad records are reported, not fatal.
    pub fn register_manifest(&mut self, manifest: &ConfigurationManifest) -> RegistrationReport {
        let mut built = Vec::new();
        let mut early_rejects = Vec::new();
        for (raw_tag, configuration) in manifest.configurations() {
            match configuration {
                Ok(c) => built.push(c),
                Err(err) => early_rejects.push((raw_tag, err)),
            }
        }

        let mut report = self.register_all(built);
        early_rejects.append(&mut report.rejected);
        report.rejected = early_rejects;
        report
    }
}
