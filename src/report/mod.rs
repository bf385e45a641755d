//! Cross-configuration comparison.
//!
//! Building a report is all-or-nothing: every requested tag is fetched from the
//! store before anything is derived, so one missing result fails the build with
//! `NotFound` instead of producing a report with a hole in it. Rendering is the
//! opposite: each figure is a cosmetic step.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::derive::{DerivedQuantities, DerivedQuantityComputer};
use crate::domain::{Configuration, Dataset, Diagnostics, RetrievalResult, RunStatus, Tag};
use crate::error::{HarnessError, Result};
use crate::math::Summary;
use crate::store::ResultStore;

pub mod format;
pub mod render;
pub mod steps;

pub use format::*;
pub use render::{ArtifactKind, ExternalRenderer, Renderer, artifact_path};
pub use steps::{RenderError, RenderSummary, SkippedArtifact};

/// One configuration's slice of the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonUnit {
    pub tag: Tag,
    pub status: RunStatus,
    pub engine: String,
    pub sample_count: usize,
    pub diagnostics: Diagnostics,
    pub completed_at: DateTime<Utc>,
    pub configuration: Configuration,
    pub derived: DerivedQuantities,
}

/// One parameter across every unit; `None` where a configuration lacks it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterRow {
    pub parameter: String,
    pub values: Vec<Option<Summary>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub object_name: String,
    pub generated_at: DateTime<Utc>,
    /// Caller order; `units` and every `ParameterRow::values` follow it.
    pub tags: Vec<Tag>,
    pub units: Vec<ComparisonUnit>,
    /// Sampled and derived parameters, plus `teff`.
    pub parameters: Vec<ParameterRow>,
    /// Tags whose configurations would drive the engine identically.
    pub identical_configurations: Vec<Vec<Tag>>,
}

impl Report {
    pub fn unit(&self, tag: &str) -> Option<&ComparisonUnit> {
        self.units.iter().find(|u| u.tag.as_str() == tag)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterRow> {
        self.parameters.iter().find(|r| r.parameter == name)
    }
}

pub struct ComparisonReportBuilder {
    store: ResultStore,
    computer: Arc<DerivedQuantityComputer>,
}

impl ComparisonReportBuilder {
    pub fn new(store: ResultStore, computer: Arc<DerivedQuantityComputer>) -> Self {
        Self { store, computer }
    }

    pub fn build(&self, tags: &[Tag], dataset: &Dataset) -> Result<Report> {
        if tags.is_empty() {
            return Err(HarnessError::Config("no tags to compare".to_string()));
        }
        let mut seen = HashSet::new();
        for tag in tags {
            if !seen.insert(tag) {
                return Err(HarnessError::DuplicateTag(tag.to_string()));
            }
        }

        let results: Vec<RetrievalResult> = tags
            .iter()
            .map(|tag| self.store.get(tag.as_str()))
            .collect::<Result<_>>()?;

        let derived: Vec<Arc<DerivedQuantities>> = results
            .par_iter()
            .map(|result| self.computer.derive(result, dataset))
            .collect::<Result<_>>()?;

        let units: Vec<ComparisonUnit> = results
            .into_iter()
            .zip(derived)
            .map(|(result, derived)| ComparisonUnit {
                tag: result.tag,
                status: result.status,
                engine: result.engine,
                sample_count: result.samples.len(),
                diagnostics: result.diagnostics,
                completed_at: result.completed_at,
                configuration: result.configuration,
                derived: (*derived).clone(),
            })
            .collect();

        let report = Report {
            object_name: dataset.object_name.clone(),
            generated_at: Utc::now(),
            tags: tags.to_vec(),
            parameters: parameter_table(&units),
            identical_configurations: identical_configurations(&units),
            units,
        };
        info!(
            tags = report.tags.len(),
            parameters = report.parameters.len(),
            "comparison report built"
        );
        Ok(report)
    }

    /// Render every artifact the renderer supports. Never fails.
    pub fn render(
        &self,
        report: &Report,
        dataset: &Dataset,
        out_dir: &Path,
        renderer: &dyn Renderer,
    ) -> RenderSummary {
        let mut summary = RenderSummary::default();
        for unit in &report.units {
            for artifact in ArtifactKind::ALL {
                summary.step(&unit.tag, artifact, || {
                    if !renderer.supports(artifact) {
                        return Err(RenderError::Unsupported {
                            renderer: renderer.name().to_string(),
                            artifact,
                        });
                    }
                    let path = artifact_path(out_dir, &unit.tag, artifact, renderer.extension());
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).map_err(|e| RenderError::io(parent, e))?;
                    }
                    renderer.render(artifact, unit, dataset, &path)?;
                    Ok(path)
                });
            }
        }
        info!(
            written = summary.written.len(),
            failed = summary.failures(),
            renderer = renderer.name(),
            "figures rendered"
        );
        summary
    }
}

fn parameter_table(units: &[ComparisonUnit]) -> Vec<ParameterRow> {
    let names: BTreeSet<&str> = units
        .iter()
        .flat_map(|u| u.derived.posterior.keys().map(String::as_str))
        .collect();

    let mut rows: Vec<ParameterRow> = names
        .into_iter()
        .map(|name| ParameterRow {
            parameter: name.to_string(),
            values: units
                .iter()
                .map(|u| u.derived.posterior.get(name).copied())
                .collect(),
        })
        .collect();

    rows.push(ParameterRow {
        parameter: "teff".to_string(),
        values: units.iter().map(|u| Some(u.derived.teff.summary)).collect(),
    });
    rows
}

fn identical_configurations(units: &[ComparisonUnit]) -> Vec<Vec<Tag>> {
    let mut claimed = vec![false; units.len()];
    let mut groups = Vec::new();
    for i in 0..units.len() {
        if claimed[i] {
            continue;
        }
        let mut group = vec![units[i].tag.clone()];
        for j in (i + 1)..units.len() {
            if !claimed[j] && units[i].configuration.same_model_as(&units[j].configuration) {
                claimed[j] = true;
                group.push(units[j].tag.clone());
            }
        }
        if group.len() > 1 {
            groups.push(group);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::*;
    use crate::derive::DerivedSettings;
    use crate::domain::{Interval, ModelToggles, PosteriorSample};
    use crate::engine::{Blackbody, ForwardModel};
    use crate::test_support::{dataset, params, result_from_samples};
    use tempfile::TempDir;

    fn blackbody_configuration(tag: &str) -> Configuration {
        let mut bounds = BTreeMap::new();
        bounds.insert("teff".to_string(), Interval::new(800.0, 2500.0));
        bounds.insert("radius".to_string(), Interval::new(0.5, 2.0));
        bounds.insert("logg".to_string(), Interval::new(2.5, 6.0));
        Configuration::new(Tag::new(tag).unwrap(), bounds, BTreeMap::new(), ModelToggles::default())
    }

    fn stored(store: &ResultStore, tag: &str, teff: f64) {
        let config = blackbody_configuration(tag);
        let samples: Vec<PosteriorSample> = (0..12)
            .map(|i| PosteriorSample {
                params: params(&[
                    ("teff", teff + i as f64),
                    ("radius", 1.0),
                    ("logg", 5.0),
                ]),
                log_likelihood: -(i as f64),
                log_prior: 0.0,
                weight: 1.0,
            })
            .collect();
        store.put(&result_from_samples(&config, samples)).unwrap();
    }

    fn builder(store: ResultStore) -> ComparisonReportBuilder {
        let model: Arc<dyn ForwardModel> = Arc::new(Blackbody::for_dataset(&dataset()));
        let computer = DerivedQuantityComputer::new(
            model,
            DerivedSettings {
                teff_samples: 5,
                spectra_samples: 3,
                teff_grid_points: 300,
                spectrum_resolution: 20.0,
                ..DerivedSettings::default()
            },
        );
        ComparisonReportBuilder::new(store, Arc::new(computer))
    }

    #[test]
    fn missing_tag_fails_the_whole_build() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        stored(&store, "ran", 1200.0);
        let tags = vec![Tag::new("ran").unwrap(), Tag::new("never-ran").unwrap()];

        let err = builder(store).build(&tags, &dataset()).unwrap_err();
        assert!(matches!(err, HarnessError::NotFound(ref t) if t == "never-ran"));
    }

    #[test]
    fn units_follow_caller_order_with_shared_parameter_table() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        stored(&store, "cool", 1000.0);
        stored(&store, "warm", 1600.0);
        let tags = vec![Tag::new("warm").unwrap(), Tag::new("cool").unwrap()];

        let report = builder(store).build(&tags, &dataset()).unwrap();
        assert_eq!(report.units[0].tag.as_str(), "warm");
        assert_eq!(report.units[1].tag.as_str(), "cool");
        assert_eq!(report.units[0].derived.best_fit.index, 0);

        let teff = report.parameter("teff").unwrap();
        let warm = teff.values[0].unwrap().median;
        let cool = teff.values[1].unwrap().median;
        assert!(warm > cool, "warm={warm} cool={cool}");

        assert!(report.parameter("mass").is_some());
        // Same bounds, priors and toggles.
        assert_eq!(report.identical_configurations.len(), 1);
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let tags = vec![Tag::new("a").unwrap(), Tag::new("a").unwrap()];
        assert!(matches!(
            builder(store).build(&tags, &dataset()),
            Err(HarnessError::DuplicateTag(_))
        ));
    }

    struct Broken;

    impl Renderer for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn extension(&self) -> &str {
            "pdf"
        }

        fn supports(&self, artifact: ArtifactKind) -> bool {
            artifact != ArtifactKind::Contribution
        }

        fn render(
            &self,
            artifact: ArtifactKind,
            _unit: &ComparisonUnit,
            _dataset: &Dataset,
            path: &Path,
        ) -> std::result::Result<(), RenderError> {
            if artifact == ArtifactKind::Posterior {
                return Err(RenderError::Failed {
                    renderer: "broken".to_string(),
                    cause: "corner plot crashed".to_string(),
                });
            }
            fs::write(path, b"%PDF").map_err(|e| RenderError::io(path, e))
        }
    }

    #[test]
    fn render_failures_are_skipped() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path().join("store")).unwrap();
        stored(&store, "warm", 1600.0);
        let builder = builder(store);
        let report = builder
            .build(&[Tag::new("warm").unwrap()], &dataset())
            .unwrap();

        let out = dir.path().join("figures");
        let summary = builder.render(&report, &dataset(), &out, &Broken);

        assert_eq!(summary.written.len(), 3);
        assert_eq!(summary.failures(), 1);
        assert_eq!(summary.skipped.len(), 2);
        let expected: PathBuf = out.join("warm").join("warm_spectrum.pdf");
        assert!(summary.written.contains(&expected));
        assert!(expected.is_file());
    }
}
