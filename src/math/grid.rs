//! Wavelength grids and trapezoid integration.

use crate::error::{HarnessError, Result};

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > min) {
        return Err(HarnessError::Config(format!(
            "invalid grid range: min={min}, max={max} (must be finite, >0, and max>min)"
        )));
    }
    if steps < 2 {
        return Err(HarnessError::Config("grid steps must be >= 2".to_string()));
    }

    let ln_min = min.ln();
    let ln_max = max.ln();
    let step = (ln_max - ln_min) / (steps as f64 - 1.0);

    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        out.push((ln_min + step * i as f64).exp());
    }
    // Pin the endpoints so exp(ln(x)) rounding never leaks outside the range.
    out[0] = min;
    out[steps - 1] = max;
    Ok(out)
}

/// Log-spaced grid at constant spectral resolution `λ/Δλ`.
pub fn resolution_grid(min: f64, max: f64, resolution: f64) -> Result<Vec<f64>> {
    if !(resolution.is_finite() && resolution > 0.0) {
        return Err(HarnessError::Config(format!(
            "spectral resolution must be positive, got {resolution}"
        )));
    }
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > min) {
        return log_space(min, max, 2);
    }
    let steps = ((max / min).ln() * resolution).ceil() as usize + 1;
    log_space(min, max, steps.max(2))
}

/// Trapezoid rule over paired samples. `x` must be ascending.
pub fn trapezoid(x: &[f64], y: &[f64]) -> f64 {
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| 0.5 * (xs[1] - xs[0]) * (ys[0] + ys[1]))
        .sum()
}
