//! Shared fixtures for unit tests.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};

use crate::domain::{
    Configuration, Dataset, Diagnostics, Interval, Measurement, ModelToggles, ObservedPoint,
    ParamVector, PointSource, PosteriorSample, RetrievalResult, RunStatus, Tag,
};

pub fn configuration(tag: &str) -> Configuration {
    let mut bounds = BTreeMap::new();
    bounds.insert("logg".to_string(), Interval::new(2.5, 6.0));
    Configuration::new(
        Tag::new(tag).unwrap(),
        bounds,
        BTreeMap::new(),
        ModelToggles::default(),
    )
}

pub fn params(pairs: &[(&str, f64)]) -> ParamVector {
    pairs.iter().map(|&(k, v)| (k.to_string(), v)).collect()
}

pub fn sample(params: ParamVector, log_likelihood: f64) -> PosteriorSample {
    PosteriorSample {
        params,
        log_likelihood,
        log_prior: 0.0,
        weight: 1.0,
    }
}

/// A completed result whose samples carry only `logg`.
pub fn result_with(configuration: &Configuration, draws: &[(f64, f64)]) -> RetrievalResult {
    let samples = draws
        .iter()
        .map(|&(logg, ll)| sample(params(&[("logg", logg)]), ll))
        .collect();
    result_from_samples(configuration, samples)
}

pub fn result_from_samples(
    configuration: &Configuration,
    samples: Vec<PosteriorSample>,
) -> RetrievalResult {
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    RetrievalResult {
        tag: configuration.tag.clone(),
        engine: "test".to_string(),
        configuration: configuration.clone(),
        status: RunStatus::Completed,
        diagnostics: Diagnostics {
            log_evidence: -1.0,
            log_evidence_err: 0.1,
            live_points: samples.len(),
            iterations: 1,
            converged: true,
        },
        samples,
        started_at: at,
        completed_at: at,
    }
}

/// Two SPHERE spectrum points and one photometric point.
pub fn dataset() -> Dataset {
    let mut ds = Dataset::new("HD 72946 B", Measurement::from((38.9809, 0.0412)));
    let sphere = PointSource::Spectrum {
        instrument: "SPHERE".to_string(),
    };
    ds.points.push(ObservedPoint {
        source: sphere.clone(),
        wavelength: 1.0,
        flux: 2.0,
        error: 0.5,
    });
    ds.points.push(ObservedPoint {
        source: sphere,
        wavelength: 1.2,
        flux: 3.0,
        error: 0.5,
    });
    ds.points.push(ObservedPoint {
        source: PointSource::Photometry {
            filter: "Paranal/SPHERE.IRDIS_D_H23_2".to_string(),
        },
        wavelength: 1.59,
        flux: 1.0,
        error: 0.25,
    });
    ds.resolutions.insert("SPHERE".to_string(), 50.0);
    ds
}
