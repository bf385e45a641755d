//! Registry of named retrieval configurations.
//!
//! Responsibilities:
//!
//! - validate bounds and priors at registration time (never at run time)
//! - keep tags unique: re-registering a tag overwrites in place, or fails in
//!   strict mode
//! - flag distinct tags that would drive the engine identically

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::derive::DERIVED_PARAMETERS;
use crate::domain::{Configuration, Interval, ModelToggles, Prior, Tag};
use crate::error::{HarnessError, Result};

pub mod manifest;

pub use manifest::*;

/// What to do when a tag is registered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationMode {
    /// Replace the existing configuration; `list()` is unaffected.
    #[default]
    Overwrite,
    /// Fail with `DuplicateTag`.
    Strict,
}

/// Outcome of registering a batch of configurations.
#[derive(Debug, Default)]
pub struct RegistrationReport {
    pub registered: Vec<Tag>,
    pub rejected: Vec<(String, HarnessError)>,
}

impl RegistrationReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ConfigurationRegistry {
    mode: RegistrationMode,
    entries: Vec<Configuration>,
    index: HashMap<Tag, usize>,
}

impl ConfigurationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self::with_mode(RegistrationMode::Strict)
    }

    pub fn with_mode(mode: RegistrationMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> RegistrationMode {
        self.mode
    }

    /// Register one configuration from its parts.
    pub fn register(
        &mut self,
        tag: Tag,
        bounds: BTreeMap<String, Interval>,
        prior: BTreeMap<String, Prior>,
        toggles: ModelToggles,
    ) -> Result<()> {
        self.insert(Configuration::new(tag, bounds, prior, toggles))
    }

    /// Register a fully-built configuration.
    pub fn insert(&mut self, configuration: Configuration) -> Result<()> {
        validate_configuration(&configuration)?;

        match self.index.get(&configuration.tag) {
            Some(&slot) => match self.mode {
                RegistrationMode::Strict => {
                    Err(HarnessError::DuplicateTag(configuration.tag.to_string()))
                }
                RegistrationMode::Overwrite => {
                    warn!(tag = %configuration.tag, "tag re-registered; replacing previous configuration");
                    self.entries[slot] = configuration;
                    Ok(())
                }
            },
            None => {
                debug!(tag = %configuration.tag, parameters = configuration.bounds.len(), "configuration registered");
                self.index
                    .insert(configuration.tag.clone(), self.entries.len());
                self.entries.push(configuration);
                Ok(())
            }
        }
    }

    /// Register many configurations; a rejected record does not affect the others.
    pub fn register_all(
        &mut self,
        configurations: impl IntoIterator<Item = Configuration>,
    ) -> RegistrationReport {
        let mut report = RegistrationReport::default();
        for configuration in configurations {
            let tag = configuration.tag.clone();
            match self.insert(configuration) {
                Ok(()) => report.registered.push(tag),
                Err(err) => {
                    warn!(tag = %tag, error = %err, "configuration rejected");
                    report.rejected.push((tag.to_string(), err));
                }
            }
        }

        for group in self.duplicate_groups() {
            let tags: Vec<&str> = group.iter().map(Tag::as_str).collect();
            warn!(
                tags = ?tags,
                "configurations share identical bounds, priors and toggles; keeping all of them"
            );
        }

        report
    }

    /// Tags in registration order.
    pub fn list(&self) -> Vec<Tag> {
        self.entries.iter().map(|c| c.tag.clone()).collect()
    }

    pub fn get(&self, tag: &str) -> Result<&Configuration> {
        self.index
            .get(tag)
            .map(|&slot| &self.entries[slot])
            .ok_or_else(|| HarnessError::NotFound(tag.to_string()))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.index.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configurations in registration order.
    pub fn configurations(&self) -> impl Iterator<Item = &Configuration> {
        self.entries.iter()
    }

    /// Groups of distinct tags whose bounds, priors and toggles are identical.
    ///
    /// Such groups are reported, never merged: they may be deliberate repeats.
    pub fn duplicate_groups(&self) -> Vec<Vec<Tag>> {
        let mut seen = vec![false; self.entries.len()];
        let mut groups = Vec::new();

        for i in 0..self.entries.len() {
            if seen[i] {
                continue;
            }
            let mut group = vec![self.entries[i].tag.clone()];
            for j in (i + 1)..self.entries.len() {
                if !seen[j] && self.entries[i].same_model_as(&self.entries[j]) {
                    seen[j] = true;
                    group.push(self.entries[j].tag.clone());
                }
            }
            if group.len() > 1 {
                groups.push(group);
            }
        }

        groups
    }
}

/// Check bounds and priors of a configuration.
pub fn validate_configuration(configuration: &Configuration) -> Result<()> {
    let tag = configuration.tag.as_str();

    for (name, interval) in &configuration.bounds {
        if !interval.is_valid() {
            return Err(HarnessError::InvalidBounds {
                tag: tag.to_string(),
                parameter: name.clone(),
                lower: interval.lower,
                upper: interval.upper,
            });
        }
    }

    for (name, prior) in &configuration.priors {
        if !prior.is_valid() {
            return Err(HarnessError::InvalidPrior {
                tag: tag.to_string(),
                parameter: name.clone(),
                reason: "standard deviation must be finite and positive".to_string(),
            });
        }
        if !configuration.bounds.contains_key(name) && !DERIVED_PARAMETERS.contains(&name.as_str())
        {
            return Err(HarnessError::InvalidPrior {
                tag: tag.to_string(),
                parameter: name.clone(),
                reason: "parameter is neither bounded nor derivable".to_string(),
            });
        }
    }

    let (w0, w1) = configuration.toggles.wavel_range;
    if !(w0.is_finite() && w1.is_finite() && w0 > 0.0 && w1 > w0) {
        return Err(HarnessError::Config(format!(
            "{tag}: invalid wavelength range ({w0}, {w1})"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(pairs: &[(&str, f64, f64)]) -> BTreeMap<String, Interval> {
        pairs
            .iter()
            .map(|&(name, lo, hi)| (name.to_string(), Interval::new(lo, hi)))
            .collect()
    }

    fn tag(s: &str) -> Tag {
        Tag::new(s).unwrap()
    }

    #[test]
    fn re_registering_a_tag_is_idempotent() {
        let mut registry = ConfigurationRegistry::new();
        registry
            .register(
                tag("no-mass-free-ab"),
                bounds(&[("logg", 2.5, 6.0)]),
                BTreeMap::new(),
                ModelToggles::default(),
            )
            .unwrap();
        registry
            .register(
                tag("no-mass-free-ab"),
                bounds(&[("logg", 3.0, 5.0)]),
                BTreeMap::new(),
                ModelToggles::default(),
            )
            .unwrap();

        assert_eq!(registry.list().len(), 1);
        let stored = registry.get("no-mass-free-ab").unwrap();
        assert_eq!(stored.bounds["logg"], Interval::new(3.0, 5.0));
    }

    #[test]
    fn strict_mode_rejects_duplicates() {
        let mut registry = ConfigurationRegistry::strict();
        let make = || {
            Configuration::new(
                tag("a"),
                bounds(&[("logg", 2.5, 6.0)]),
                BTreeMap::new(),
                ModelToggles::default(),
            )
        };
        registry.insert(make()).unwrap();
        assert!(matches!(
            registry.insert(make()),
            Err(HarnessError::DuplicateTag(t)) if t == "a"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn inverted_bounds_fail_at_registration() {
        let mut registry = ConfigurationRegistry::new();
        let err = registry
            .register(
                tag("fixab"),
                bounds(&[("c_o_ratio", 0.512, 0.047)]),
                BTreeMap::new(),
                ModelToggles::default(),
            )
            .unwrap_err();
        assert!(matches!(err, HarnessError::InvalidBounds { ref parameter, .. } if parameter == "c_o_ratio"));
        assert!(registry.is_empty());
    }

    #[test]
    fn one_bad_record_does_not_block_siblings() {
        let mut registry = ConfigurationRegistry::new();
        let good = Configuration::new(
            tag("good"),
            bounds(&[("logg", 2.5, 6.0)]),
            BTreeMap::new(),
            ModelToggles::default(),
        );
        let bad = Configuration::new(
            tag("bad"),
            bounds(&[("logg", 6.0, 2.5)]),
            BTreeMap::new(),
            ModelToggles::default(),
        );
        let report = registry.register_all([bad, good]);
        assert_eq!(report.registered, vec![tag("good")]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, "bad");
    }

    #[test]
    fn prior_on_unknown_parameter_is_rejected() {
        let mut priors = BTreeMap::new();
        priors.insert(
            "teff".to_string(),
            Prior::Normal {
                mean: 1500.0,
                std: 50.0,
            },
        );
        let configuration = Configuration::new(
            tag("x"),
            bounds(&[("logg", 2.5, 6.0)]),
            priors,
            ModelToggles::default(),
        );
        assert!(matches!(
            validate_configuration(&configuration),
            Err(HarnessError::InvalidPrior { .. })
        ));
    }

    #[test]
    fn mass_prior_is_allowed_without_bounds() {
        let mut priors = BTreeMap::new();
        priors.insert(
            "mass".to_string(),
            Prior::Normal {
                mean: 69.5,
                std: 0.5,
            },
        );
        let configuration = Configuration::new(
            tag("mass"),
            bounds(&[("logg", 2.5, 6.0), ("radius", 0.5, 2.0)]),
            priors,
            ModelToggles::default(),
        );
        assert!(validate_configuration(&configuration).is_ok());
    }

    #[test]
    fn identical_models_are_flagged_not_merged() {
        let mut registry = ConfigurationRegistry::new();
        for name in ["nomass-fixab", "nomass-fixab-copy", "mass-fixab"] {
            let mut priors = BTreeMap::new();
            if name.starts_with("mass") {
                priors.insert(
                    "mass".to_string(),
                    Prior::Normal {
                        mean: 69.5,
                        std: 0.5,
                    },
                );
            }
            registry
                .register(
                    tag(name),
                    bounds(&[("logg", 2.5, 6.0), ("radius", 0.5, 2.0)]),
                    priors,
                    ModelToggles::default(),
                )
                .unwrap();
        }

        let groups = registry.duplicate_groups();
        assert_eq!(groups, vec![vec![tag("nomass-fixab"), tag("nomass-fixab-copy")]]);
        assert_eq!(registry.len(), 3);
    }
}
