//! The three passes of a retrieval study, shared by every front-end:
//!
//! ingest (dataset -> store) -> run (configurations -> results) ->
//! compare (results -> report, exports, figures)
//!
//! The CLI only parses arguments and prints; everything here returns data.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::derive::DerivedQuantityComputer;
use crate::domain::{Configuration, Dataset, SamplerSettings, Tag};
use crate::error::{HarnessError, Result};
use crate::io::{load_dataset, write_report_json, write_residuals_csv};
use crate::registry::{ConfigurationManifest, ConfigurationRegistry, RegistrationMode};
use crate::report::{ComparisonReportBuilder, RenderSummary, Renderer, Report};
use crate::runner::{CancelToken, RetrievalRunner, RunHandle};
use crate::store::ResultStore;

/// Ingest a dataset manifest and snapshot the dataset into the store.
pub fn ingest(store: &ResultStore, manifest: &Path) -> Result<Dataset> {
    let dataset = load_dataset(manifest)?;
    store.put_dataset(&dataset)?;
    Ok(dataset)
}

/// Build a registry from a configuration manifest.
///
/// Rejected records are logged and left out; the rest stay usable.
pub fn load_registry(manifest: &Path, strict: bool) -> Result<ConfigurationRegistry> {
    let manifest = ConfigurationManifest::load(manifest)?;
    let mut registry = ConfigurationRegistry::with_mode(if strict {
        RegistrationMode::Strict
    } else {
        RegistrationMode::Overwrite
    });
    let report = registry.register_manifest(&manifest);
    if !report.is_clean() {
        warn!(
            registered = report.registered.len(),
            rejected = report.rejected.len(),
            "some configurations were rejected"
        );
    }
    if registry.is_empty() {
        return Err(HarnessError::Config(
            "manifest yields no valid configurations".to_string(),
        ));
    }
    Ok(registry)
}

/// Configurations for `tags` in the given order, or every one when empty.
pub fn select(registry: &ConfigurationRegistry, tags: &[String]) -> Result<Vec<Configuration>> {
    if tags.is_empty() {
        return Ok(registry.configurations().cloned().collect());
    }
    tags.iter()
        .map(|tag| registry.get(tag).cloned())
        .collect()
}

/// Run every configuration against the stored dataset.
pub fn run_pass(
    config: &HarnessConfig,
    store: &ResultStore,
    configurations: &[Configuration],
    settings: &SamplerSettings,
    workers: usize,
    cancel: &CancelToken,
) -> Result<Vec<RunHandle>> {
    let dataset = store.get_dataset()?;
    let sampler = config.sampler(dataset.distance_m())?;
    let runner = RetrievalRunner::new(store.clone(), sampler);
    runner.run_all(configurations, &dataset, settings, workers, cancel)
}

/// Everything the compare pass produced.
#[derive(Debug)]
pub struct CompareOutput {
    pub report: Report,
    pub report_path: PathBuf,
    pub residual_paths: Vec<PathBuf>,
    pub figures: Option<RenderSummary>,
}

/// Build the report, write the required exports, then render figures.
///
/// Report JSON and residual CSVs are required: their errors propagate.
/// Figures are best-effort.
pub fn compare_pass(
    config: &HarnessConfig,
    store: &ResultStore,
    tags: &[Tag],
    out_dir: &Path,
    renderer: Option<&dyn Renderer>,
) -> Result<CompareOutput> {
    let dataset = store.get_dataset()?;
    let model = config.forward_model(dataset.distance_m())?;
    let computer = Arc::new(DerivedQuantityComputer::new(model, config.derived.clone()));
    let builder = ComparisonReportBuilder::new(store.clone(), computer);

    let report = builder.build(tags, &dataset)?;

    let report_path = out_dir.join("report.json");
    write_report_json(&report_path, &report)?;

    let mut residual_paths = Vec::with_capacity(report.units.len());
    for unit in &report.units {
        let path = out_dir
            .join(unit.tag.as_str())
            .join(format!("{}_residuals.csv", unit.tag));
        write_residuals_csv(&path, &unit.tag, &unit.derived.residuals)?;
        residual_paths.push(path);
    }
    info!(report = %report_path.display(), exports = residual_paths.len(), "compare outputs written");

    let figures = renderer.map(|r| builder.render(&report, &dataset, out_dir, r));

    Ok(CompareOutput {
        report,
        report_path,
        residual_paths,
        figures,
    })
}

/// Tags for `compare`: explicit tags, else the manifest's, else all stored.
pub fn compare_tags(store: &ResultStore, tags: &[String], manifest: Option<&Path>) -> Result<Vec<Tag>> {
    if !tags.is_empty() {
        return tags.iter().map(|t| Tag::new(t.as_str())).collect();
    }
    if let Some(manifest) = manifest {
        return Ok(load_registry(manifest, false)?.list());
    }
    let stored = store.list_tags()?;
    if stored.is_empty() {
        return Err(HarnessError::NotFound(
            "store holds no results to compare".to_string(),
        ));
    }
    Ok(stored)
}
