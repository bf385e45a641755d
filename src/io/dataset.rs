//! Dataset ingest.
//!
//! A dataset manifest (TOML) names the object, its parallax and the data files:
//!
//! ```toml
//! object_name = "HD 72946 B"
//! parallax = [38.9809, 0.0412]
//!
//! [[spectrum]]
//! instrument = "SPHERE"
//! file = "HD72946_SPHEREYJ_fluxcal_spectrum_revised.dat"
//! resolution = 50.0
//!
//! [photometry]
//! file = "HD72946_SPHEREH_fluxcal_photometry_revised.dat"
//! filters = ["Paranal/SPHERE.IRDIS_D_H23_2", "Paranal/SPHERE.IRDIS_D_H23_3"]
//! ```
//!
//! Data files are tab-delimited `wavelength flux error` rows; `#` starts a
//! comment line. Photometry rows are mapped to `filters` in order. Points keep
//! file order: spectra in manifest order, then photometry.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use serde::Deserialize;
use tracing::info;

use crate::domain::{Dataset, Measurement, ObservedPoint, PointSource};
use crate::error::{HarnessError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetManifest {
    pub object_name: String,
    /// Parallax and its error (mas).
    pub parallax: Measurement,
    #[serde(default)]
    pub spectrum: Vec<SpectrumFile>,
    #[serde(default)]
    pub photometry: Option<PhotometryFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpectrumFile {
    pub instrument: String,
    pub file: PathBuf,
    pub resolution: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhotometryFile {
    pub file: PathBuf,
    pub filters: Vec<String>,
}

impl DatasetManifest {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| HarnessError::Config(format!("dataset manifest: {e}")))
    }
}

/// Read a dataset manifest and every file it references.
///
/// Relative file paths resolve against the manifest's directory.
pub fn load_dataset(manifest_path: &Path) -> Result<Dataset> {
    let text = std::fs::read_to_string(manifest_path).map_err(|e| HarnessError::io(manifest_path, e))?;
    let manifest = DatasetManifest::parse(&text)?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let dataset = build_dataset(&manifest, base)?;
    info!(
        object = %dataset.object_name,
        points = dataset.len(),
        instruments = dataset.instruments().len(),
        "dataset ingested"
    );
    Ok(dataset)
}

pub fn build_dataset(manifest: &DatasetManifest, base: &Path) -> Result<Dataset> {
    let mut dataset = Dataset::new(manifest.object_name.clone(), manifest.parallax);

    for entry in &manifest.spectrum {
        if !(entry.resolution.is_finite() && entry.resolution > 0.0) {
            return Err(HarnessError::Dataset(format!(
                "{}: resolution must be positive",
                entry.instrument
            )));
        }
        let rows = read_table(&base.join(&entry.file))?;
        for (wavelength, flux, error) in rows {
            dataset.points.push(ObservedPoint {
                source: PointSource::Spectrum {
                    instrument: entry.instrument.clone(),
                },
                wavelength,
                flux,
                error,
            });
        }
        dataset
            .resolutions
            .insert(entry.instrument.clone(), entry.resolution);
    }

    if let Some(phot) = &manifest.photometry {
        let path = base.join(&phot.file);
        let rows = read_table(&path)?;
        if rows.len() != phot.filters.len() {
            return Err(HarnessError::Dataset(format!(
                "'{}' has {} rows but {} filters are named",
                path.display(),
                rows.len(),
                phot.filters.len()
            )));
        }
        for ((wavelength, flux, error), filter) in rows.into_iter().zip(&phot.filters) {
            dataset.points.push(ObservedPoint {
                source: PointSource::Photometry {
                    filter: filter.clone(),
                },
                wavelength,
                flux,
                error,
            });
        }
    }

    if dataset.is_empty() {
        return Err(HarnessError::Dataset(
            "dataset manifest yields no points".to_string(),
        ));
    }
    dataset.validate()?;
    Ok(dataset)
}

/// Read `wavelength flux error` rows from a tab-delimited file.
pub fn read_table(path: &Path) -> Result<Vec<(f64, f64, f64)>> {
    if is_binary_container(path) {
        return Err(HarnessError::Dataset(format!(
            "'{}' is a FITS container; convert it to a tab-delimited table with an external parser first",
            path.display()
        )));
    }

    let file = File::open(path).map_err(|e| HarnessError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let line = idx + 1;
        let record = record.map_err(|e| {
            HarnessError::Dataset(format!("{}: row {line}: {e}", path.display()))
        })?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        let row = parse_row(&record)
            .map_err(|msg| HarnessError::Dataset(format!("{}: row {line}: {msg}", path.display())))?;
        rows.push(row);
    }
    Ok(rows)
}

fn parse_row(record: &StringRecord) -> std::result::Result<(f64, f64, f64), String> {
    // Some writers pad with extra tabs; keep the non-empty fields.
    let fields: Vec<&str> = record.iter().filter(|f| !f.is_empty()).collect();
    if fields.len() != 3 {
        return Err(format!("expected 3 columns, found {}", fields.len()));
    }
    let parse = |name: &str, s: &str| -> std::result::Result<f64, String> {
        s.parse::<f64>()
            .map_err(|_| format!("invalid {name} '{s}'"))
    };
    Ok((
        parse("wavelength", fields[0])?,
        parse("flux", fields[1])?,
        parse("error", fields[2])?,
    ))
}

fn is_binary_container(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "fits" | "fit" | "fts"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) {
        fs::write(dir.path().join(name), body).unwrap();
    }

    #[test]
    fn spectra_then_photometry_in_file_order() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "spectrum.dat",
            "# wavelength\tflux\terror\n1.0\t2.0e-16\t1.0e-17\n1.1\t2.5e-16\t1.0e-17\n",
        );
        write(&dir, "phot.dat", "1.59\t3.0e-16\t2.0e-17\n1.67\t2.8e-16\t2.0e-17\n");
        write(
            &dir,
            "dataset.toml",
            r#"
            object_name = "HD 72946 B"
            parallax = [38.9809, 0.0412]

            [[spectrum]]
            instrument = "SPHERE"
            file = "spectrum.dat"
            resolution = 50.0

            [photometry]
            file = "phot.dat"
            filters = ["Paranal/SPHERE.IRDIS_D_H23_2", "Paranal/SPHERE.IRDIS_D_H23_3"]
            "#,
        );

        let ds = load_dataset(&dir.path().join("dataset.toml")).unwrap();
        assert_eq!(ds.len(), 4);
        assert_eq!(ds.wavelengths(), vec![1.0, 1.1, 1.59, 1.67]);
        assert_eq!(ds.points[2].source.label(), "Paranal/SPHERE.IRDIS_D_H23_2");
        assert_eq!(ds.resolutions.get("SPHERE"), Some(&50.0));
        assert_eq!(ds.parallax.value, 38.9809);
    }

    #[test]
    fn filter_count_must_match_rows() {
        let dir = TempDir::new().unwrap();
        write(&dir, "phot.dat", "1.59\t3.0\t0.2\n");
        let manifest = DatasetManifest::parse(
            r#"
            object_name = "x"
            parallax = [10.0, 0.1]
            [photometry]
            file = "phot.dat"
            filters = ["a", "b"]
            "#,
        )
        .unwrap();
        assert!(matches!(
            build_dataset(&manifest, dir.path()),
            Err(HarnessError::Dataset(_))
        ));
    }

    #[test]
    fn fits_is_rejected() {
        let err = read_table(Path::new("HD72946B_GRAVITYK.fits")).unwrap_err();
        assert!(matches!(err, HarnessError::Dataset(ref m) if m.contains("FITS")));
    }

    #[test]
    fn malformed_row_names_line() {
        let dir = TempDir::new().unwrap();
        write(&dir, "bad.dat", "1.0\t2.0\t0.1\n1.1\tnope\t0.1\n");
        let err = read_table(&dir.path().join("bad.dat")).unwrap_err();
        assert!(matches!(err, HarnessError::Dataset(ref m) if m.contains("row 2") && m.contains("flux")));
    }
}
