//! ASCII spectrum preview.
//!
//! Fixed-size grid, deterministic output. Elements:
//! - best-fit model spectrum: `-` line
//! - spectrum points: `o`
//! - photometry: `#`
//! - the largest normalized residuals: `!`

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::derive::{ModelSpectrum, PointResidual, Residuals, largest_deviations};
use crate::domain::{Dataset, PointSource};
use crate::report::{ArtifactKind, ComparisonUnit, RenderError, Renderer};

/// Render the model spectrum with the observed points on top.
pub fn render_spectrum_plot(
    model: &ModelSpectrum,
    residuals: &Residuals,
    highlights: &[PointResidual],
    width: usize,
    height: usize,
) -> String {
    let width = width.max(10);
    let height = height.max(5);

    let (w_min, w_max) = wavelength_range(&residuals.points).unwrap_or((0.5, 6.0));
    let curve: Vec<(f64, f64)> = model
        .wavelengths
        .iter()
        .zip(&model.flux)
        .map(|(&w, &f)| (w, f))
        .filter(|&(w, _)| w >= w_min && w <= w_max)
        .collect();

    let (f_min, f_max) = flux_range(&residuals.points, &curve).unwrap_or((0.0, 1.0));
    let (f_min, f_max) = pad_range(f_min, f_max, 0.05);

    let mut grid = vec![vec![' '; width]; height];
    draw_curve(&mut grid, &curve, w_min, w_max, f_min, f_max);

    let flagged: HashSet<usize> = highlights.iter().map(|p| p.index).collect();
    for p in &residuals.points {
        let x = map_x(p.wavelength, w_min, w_max, width);
        let y = map_y(p.observed, f_min, f_max, height);
        grid[y][x] = if flagged.contains(&p.index) {
            '!'
        } else {
            match p.source {
                PointSource::Spectrum { .. } => 'o',
                PointSource::Photometry { .. } => '#',
            }
        };
    }

    let mut out = String::new();
    out.push_str(&format!(
        "Plot: wavelength=[{w_min:.3}, {w_max:.3}] um | flux=[{f_min:.3e}, {f_max:.3e}] W m-2 um-1\n"
    ));
    for row in grid {
        out.push_str(&row.into_iter().collect::<String>());
        out.push('\n');
    }
    out
}

/// Writes the spectrum preview as a text file; other artifacts are unsupported.
#[derive(Debug, Clone)]
pub struct AsciiRenderer {
    pub width: usize,
    pub height: usize,
    /// Points flagged with `!`.
    pub highlight: usize,
}

impl Default for AsciiRenderer {
    fn default() -> Self {
        Self {
            width: 100,
            height: 25,
            highlight: 3,
        }
    }
}

impl Renderer for AsciiRenderer {
    fn name(&self) -> &str {
        "ascii"
    }

    fn extension(&self) -> &str {
        "txt"
    }

    fn supports(&self, artifact: ArtifactKind) -> bool {
        artifact == ArtifactKind::Spectrum
    }

    fn render(
        &self,
        artifact: ArtifactKind,
        unit: &ComparisonUnit,
        _dataset: &Dataset,
        path: &Path,
    ) -> Result<(), RenderError> {
        if !self.supports(artifact) {
            return Err(RenderError::Unsupported {
                renderer: self.name().to_string(),
                artifact,
            });
        }
        let residuals = &unit.derived.residuals;
        let text = render_spectrum_plot(
            &unit.derived.model_spectrum,
            residuals,
            &largest_deviations(residuals, self.highlight),
            self.width,
            self.height,
        );
        fs::write(path, text).map_err(|e| RenderError::io(path, e))
    }
}

fn wavelength_range(points: &[PointResidual]) -> Option<(f64, f64)> {
    let mut min_w = f64::INFINITY;
    let mut max_w = f64::NEG_INFINITY;
    for p in points {
        min_w = min_w.min(p.wavelength);
        max_w = max_w.max(p.wavelength);
    }
    (min_w.is_finite() && max_w.is_finite() && max_w > min_w).then_some((min_w, max_w))
}

fn flux_range(points: &[PointResidual], curve: &[(f64, f64)]) -> Option<(f64, f64)> {
    let mut min_f = f64::INFINITY;
    let mut max_f = f64::NEG_INFINITY;
    for p in points {
        min_f = min_f.min(p.observed);
        max_f = max_f.max(p.observed);
    }
    for &(_, f) in curve {
        min_f = min_f.min(f);
        max_f = max_f.max(f);
    }
    (min_f.is_finite() && max_f.is_finite() && max_f > min_f).then_some((min_f, max_f))
}

fn pad_range(min: f64, max: f64, frac: f64) -> (f64, f64) {
    let span = (max - min).abs();
    let pad = (span * frac).max(1e-30);
    (min - pad, max + pad)
}

fn map_x(w: f64, w_min: f64, w_max: f64, width: usize) -> usize {
    let width = width.max(2);
    let u = ((w - w_min) / (w_max - w_min)).clamp(0.0, 1.0);
    (u * (width as f64 - 1.0)).round() as usize
}

fn map_y(f: f64, f_min: f64, f_max: f64, height: usize) -> usize {
    let height = height.max(2);
    let u = ((f - f_min) / (f_max - f_min)).clamp(0.0, 1.0);
    // Row 0 is the top.
    (height as f64 - 1.0 - (u * (height as f64 - 1.0))).round() as usize
}

fn draw_curve(grid: &mut [Vec<char>], curve: &[(f64, f64)], w_min: f64, w_max: f64, f_min: f64, f_max: f64) {
    if curve.len() < 2 {
        return;
    }
    let height = grid.len();
    let width = grid[0].len();

    let mut prev = None;
    for &(w, f) in curve {
        let x = map_x(w, w_min, w_max, width);
        let y = map_y(f, f_min, f_max, height);
        if let Some((x0, y0)) = prev {
            draw_line(grid, x0, y0, x, y, '-');
        } else {
            grid[y][x] = '-';
        }
        prev = Some((x, y));
    }
}

/// Integer line drawing (Bresenham).
fn draw_line(grid: &mut [Vec<char>], x0: usize, y0: usize, x1: usize, y1: usize, ch: char) {
    let mut x0 = x0 as isize;
    let mut y0 = y0 as isize;
    let x1 = x1 as isize;
    let y1 = y1 as isize;

    let dx = (x1 - x0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let dy = -(y1 - y0).abs();
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        if y0 >= 0
            && (y0 as usize) < grid.len()
            && x0 >= 0
            && (x0 as usize) < grid[0].len()
            && grid[y0 as usize][x0 as usize] == ' '
        {
            grid[y0 as usize][x0 as usize] = ch;
        }

        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(index: usize, wavelength: f64, observed: f64) -> PointResidual {
        PointResidual {
            index,
            source: PointSource::Spectrum {
                instrument: "SPHERE".to_string(),
            },
            wavelength,
            observed,
            error: 0.1,
            model: 1.0,
            residual: observed - 1.0,
            normalized: (observed - 1.0) / 0.1,
        }
    }

    fn fixture() -> (ModelSpectrum, Residuals) {
        let model = ModelSpectrum {
            wavelengths: vec![1.0, 2.0],
            flux: vec![1.0, 1.0],
        };
        let residuals = Residuals {
            points: vec![point(0, 1.0, 1.0), point(1, 2.0, 2.0)],
            chi_squared: 100.0,
            reduced_chi_squared: None,
        };
        (model, residuals)
    }

    #[test]
    fn plot_golden_snapshot_small() {
        let (model, residuals) = fixture();
        let txt = render_spectrum_plot(&model, &residuals, &[], 10, 5);
        let expected = concat!(
            "Plot: wavelength=[1.000, 2.000] um | flux=[9.500e-1, 2.050e0] W m-2 um-1\n",
            "         o\n",
            "          \n",
            "          \n",
            "          \n",
            "o---------\n",
        );
        assert_eq!(txt, expected);
    }

    #[test]
    fn highlighted_points_are_marked() {
        let (model, residuals) = fixture();
        let top = largest_deviations(&residuals, 1);
        let txt = render_spectrum_plot(&model, &residuals, &top, 10, 5);
        assert_eq!(txt.lines().nth(1), Some("         !"));
    }
}
