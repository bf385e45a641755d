//! Gaussian likelihood over the observed points a configuration includes.

use crate::domain::{Configuration, Dataset, ParamVector, PointSource};
use crate::engine::{ForwardModel, checked_spectrum};
use crate::error::{HarnessError, Result};

/// Indices of the dataset points a configuration fits, in dataset order.
///
/// Spectrum points must belong to an instrument in `inc_spec` (all instruments
/// when the list is empty) and lie inside `wavel_range`. Photometry is kept
/// when `inc_phot` is set.
pub fn selected_points(configuration: &Configuration, dataset: &Dataset) -> Result<Vec<usize>> {
    let toggles = &configuration.toggles;
    let (w0, w1) = toggles.wavel_range;

    let selected: Vec<usize> = dataset
        .points
        .iter()
        .enumerate()
        .filter(|(_, p)| match &p.source {
            PointSource::Spectrum { instrument } => {
                (toggles.inc_spec.is_empty() || toggles.inc_spec.iter().any(|i| i == instrument))
                    && p.wavelength >= w0
                    && p.wavelength <= w1
            }
            PointSource::Photometry { .. } => toggles.inc_phot,
        })
        .map(|(idx, _)| idx)
        .collect();

    if selected.is_empty() {
        return Err(HarnessError::Dataset(format!(
            "configuration '{}' selects no observed points",
            configuration.tag
        )));
    }
    Ok(selected)
}

/// `ln L` of one parameter vector, with `scaling_<instrument>` calibration applied.
pub fn log_likelihood(
    dataset: &Dataset,
    selected: &[usize],
    model: &dyn ForwardModel,
    params: &ParamVector,
) -> Result<f64> {
    let calibrated = dataset.with_calibration(params);
    let wavelengths: Vec<f64> = selected
        .iter()
        .map(|&i| calibrated.points[i].wavelength)
        .collect();
    let flux = checked_spectrum(model, params, &wavelengths)?;

    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let ll = selected
        .iter()
        .zip(&flux)
        .map(|(&i, &m)| {
            let p = &calibrated.points[i];
            let z = (p.flux - m) / p.error;
            -0.5 * (z * z + ln_2pi) - p.error.ln()
        })
        .sum();
    Ok(ll)
}
