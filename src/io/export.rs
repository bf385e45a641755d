//! Export per-point residuals to CSV.
//!
//! One file per configuration, rows in dataset order, meant for spreadsheets
//! and downstream scripts.

use std::path::Path;

use serde::Serialize;

use crate::derive::Residuals;
use crate::domain::{PointSource, Tag};
use crate::error::{HarnessError, Result};

#[derive(Debug, Serialize)]
struct ResidualRow<'a> {
    tag: &'a str,
    index: usize,
    kind: &'static str,
    source: &'a str,
    wavelength_um: f64,
    observed: f64,
    error: f64,
    model: f64,
    residual: f64,
    normalized: f64,
}

/// Write the residual table of `tag` to `path`, replacing any existing file.
pub fn write_residuals_csv(path: &Path, tag: &Tag, residuals: &Residuals) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| HarnessError::io(parent, e))?;
    }
    let mut writer = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;

    for p in &residuals.points {
        let kind = match p.source {
            PointSource::Spectrum { .. } => "spectrum",
            PointSource::Photometry { .. } => "photometry",
        };
        writer
            .serialize(ResidualRow {
                tag: tag.as_str(),
                index: p.index,
                kind,
                source: p.source.label(),
                wavelength_um: p.wavelength,
                observed: p.observed,
                error: p.error,
                model: p.model,
                residual: p.residual,
                normalized: p.normalized,
            })
            .map_err(|e| csv_error(path, e))?;
    }

    writer
        .flush()
        .map_err(|e| HarnessError::io(path, e))?;
    Ok(())
}

fn csv_error(path: &Path, err: csv::Error) -> HarnessError {
    match err.into_kind() {
        csv::ErrorKind::Io(source) => HarnessError::io(path, source),
        other => HarnessError::Config(format!("CSV export '{}': {other:?}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::compute_residuals;
    use crate::domain::ParamVector;
    use crate::engine::ConstantSpectrum;
    use crate::test_support::dataset;
    use tempfile::TempDir;

    #[test]
    fn rows_follow_dataset_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("a_residuals.csv");
        let residuals = compute_residuals(&dataset(), &ParamVector::new(), &ConstantSpectrum::new(2.0)).unwrap();

        write_residuals_csv(&path, &Tag::new("a").unwrap(), &residuals).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "tag");
        assert_eq!(&headers[8], "residual");

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][2], "spectrum");
        assert_eq!(&rows[2][2], "photometry");
        assert_eq!(rows[1][8].parse::<f64>().unwrap(), 1.0);
    }
}
