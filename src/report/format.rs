//! Terminal output.
//!
//! Formatting lives in one place so the derivation code stays free of
//! presentation and output changes stay local.

use std::collections::BTreeMap;

use crate::derive::{PointResidual, largest_deviations};
use crate::domain::RetrievalResult;
use crate::math::Summary;
use crate::report::{ComparisonUnit, Report};
use crate::runner::RunHandle;

const TAG_WIDTH: usize = 40;

/// Full comparison: overview, parameter table, worst-fit points per tag.
pub fn format_report(report: &Report, top_n: usize) -> String {
    let mut out = String::new();

    out.push_str(&format!("=== Retrieval comparison: {} ===\n", report.object_name));
    out.push_str(&format!(
        "Generated: {}\n\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    out.push_str(&format_overview(&report.units));
    out.push('\n');

    out.push_str("Posterior medians (16th-84th):\n");
    out.push_str(&format_parameter_table(report));

    for group in &report.identical_configurations {
        let tags: Vec<&str> = group.iter().map(|t| t.as_str()).collect();
        out.push_str(&format!("\nnote: identical configurations: {}\n", tags.join(", ")));
    }

    if top_n > 0 {
        for unit in &report.units {
            out.push_str(&format!("\nLargest deviations ({}):\n", unit.tag));
            out.push_str(&format_deviations(&largest_deviations(
                &unit.derived.residuals,
                top_n,
            )));
        }
    }

    out
}

fn format_overview(units: &[ComparisonUnit]) -> String {
    let mut out = String::new();
    push_line(
        &mut out,
        format!(
            "{:<TAG_WIDTH$} {:<18} {:>8} {:>12} {:>16} {:>10}",
            "tag", "status", "samples", "ln Z", "Teff (K)", "chi2_red"
        ),
    );
    push_line(
        &mut out,
        format!(
            "{:-<TAG_WIDTH$} {:-<18} {:->8} {:->12} {:->16} {:->10}",
            "", "", "", "", "", ""
        ),
    );
    for u in units {
        push_line(
            &mut out,
            format!(
                "{:<TAG_WIDTH$} {:<18} {:>8} {:>12.2} {:>16} {:>10}",
                truncate(u.tag.as_str(), TAG_WIDTH),
                u.status.label(),
                u.sample_count,
                u.diagnostics.log_evidence,
                fmt_summary(&u.derived.teff.summary, 0),
                u.derived
                    .residuals
                    .reduced_chi_squared
                    .map(|c| format!("{c:.2}"))
                    .unwrap_or_else(|| "-".to_string()),
            ),
        );
    }
    out
}

fn format_parameter_table(report: &Report) -> String {
    const COLUMN: usize = 24;
    let mut out = String::new();

    let mut header = format!("{:<16}", "parameter");
    let mut rule = format!("{:-<16}", "");
    for tag in &report.tags {
        header.push_str(&format!(" {:>COLUMN$}", truncate(tag.as_str(), COLUMN)));
        rule.push_str(&format!(" {:->COLUMN$}", ""));
    }
    push_line(&mut out, header);
    push_line(&mut out, rule);

    for row in &report.parameters {
        let mut line = format!("{:<16}", truncate(&row.parameter, 16));
        for value in &row.values {
            let cell = value
                .as_ref()
                .map(|s| fmt_summary(s, 3))
                .unwrap_or_else(|| "-".to_string());
            line.push_str(&format!(" {cell:>COLUMN$}"));
        }
        push_line(&mut out, line);
    }
    out
}

/// Residual table, one row per point.
pub fn format_deviations(rows: &[PointResidual]) -> String {
    let mut out = String::new();
    push_line(
        &mut out,
        format!(
            "{:<32} {:>10} {:>12} {:>12} {:>12} {:>8}",
            "source", "wl (um)", "observed", "model", "residual", "sigma"
        ),
    );
    push_line(
        &mut out,
        format!(
            "{:-<32} {:->10} {:->12} {:->12} {:->12} {:->8}",
            "", "", "", "", "", ""
        ),
    );
    for r in rows {
        push_line(
            &mut out,
            format!(
                "{:<32} {:>10.4} {:>12.4e} {:>12.4e} {:>12.4e} {:>8.2}",
                truncate(r.source.label(), 32),
                r.wavelength,
                r.observed,
                r.model,
                r.residual,
                r.normalized,
            ),
        );
    }
    out
}

/// One line per stored result.
pub fn format_result_list(results: &[RetrievalResult]) -> String {
    let mut out = String::new();
    push_line(
        &mut out,
        format!(
            "{:<TAG_WIDTH$} {:<18} {:<10} {:>8} {:>12} {:<20}",
            "tag", "status", "engine", "samples", "ln Z", "completed"
        ),
    );
    for r in results {
        push_line(
            &mut out,
            format!(
                "{:<TAG_WIDTH$} {:<18} {:<10} {:>8} {:>12.2} {:<20}",
                truncate(r.tag.as_str(), TAG_WIDTH),
                r.status.label(),
                truncate(&r.engine, 10),
                r.sample_count(),
                r.diagnostics.log_evidence,
                r.completed_at.format("%Y-%m-%d %H:%M:%S"),
            ),
        );
    }
    out
}

/// Details of one stored result.
pub fn format_result_summary(result: &RetrievalResult, posterior: &BTreeMap<String, Summary>) -> String {
    let mut out = String::new();
    let d = &result.diagnostics;

    out.push_str(&format!("=== {} ===\n", result.tag));
    out.push_str(&format!("Status: {} | engine: {}\n", result.status.label(), result.engine));
    out.push_str(&format!(
        "Samples: {} | live points: {} | iterations: {} | converged: {}\n",
        result.sample_count(),
        d.live_points,
        d.iterations,
        d.converged
    ));
    out.push_str(&format!(
        "ln Z = {:.3} +/- {:.3}\n",
        d.log_evidence, d.log_evidence_err
    ));
    out.push_str(&format!(
        "Run: {} -> {}\n",
        result.started_at.format("%Y-%m-%d %H:%M:%S"),
        result.completed_at.format("%Y-%m-%d %H:%M:%S")
    ));

    let t = &result.configuration.toggles;
    out.push_str(&format!(
        "Model: pt={:?} chemistry={:?} clouds=[{}] scattering={} grid={:?}\n",
        t.pt_profile,
        t.chemistry,
        t.cloud_species.join(", "),
        t.scattering,
        t.pressure_grid
    ));

    out.push_str("\nPosterior:\n");
    for (name, s) in posterior {
        let bounds = result
            .configuration
            .bounds
            .get(name)
            .map(|b| format!("[{}, {}]", b.lower, b.upper))
            .unwrap_or_else(|| "derived".to_string());
        push_line(
            &mut out,
            format!("  {:<20} {:>28} {:>16}", name, fmt_summary(s, 4), bounds),
        );
    }
    out
}

/// Outcome of a `run` pass.
pub fn format_run_handles(handles: &[RunHandle]) -> String {
    let mut out = String::new();
    push_line(
        &mut out,
        format!(
            "{:<TAG_WIDTH$} {:<18} {:>10} {:>10}  {}",
            "tag", "outcome", "iters", "secs", "detail"
        ),
    );
    for h in handles {
        let detail = match &h.outcome {
            crate::runner::RunOutcome::Failed {
                cause,
                partial_stored,
            } => {
                if *partial_stored {
                    format!("{cause} (partial stored)")
                } else {
                    cause.clone()
                }
            }
            _ => String::new(),
        };
        push_line(
            &mut out,
            format!(
                "{:<TAG_WIDTH$} {:<18} {:>10} {:>10.1}  {}",
                truncate(h.tag.as_str(), TAG_WIDTH),
                h.outcome.label(),
                h.iterations,
                h.elapsed.as_secs_f64(),
                detail
            ),
        );
    }
    out
}

/// `median +hi/-lo`.
pub fn fmt_summary(s: &Summary, precision: usize) -> String {
    format!(
        "{:.p$} +{:.p$}/-{:.p$}",
        s.median,
        s.p84 - s.median,
        s.median - s.p16,
        p = precision
    )
}

fn push_line(out: &mut String, line: String) {
    out.push_str(line.trim_end());
    out.push('\n');
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_shows_asymmetric_band() {
        let s = Summary {
            median: 1500.0,
            p16: 1480.0,
            p84: 1530.0,
            mean: 1502.0,
            std: 20.0,
            count: 30,
        };
        assert_eq!(fmt_summary(&s, 0), "1500 +30/-20");
    }

    #[test]
    fn long_tags_are_truncated() {
        assert_eq!(truncate("HD72946B-am-molliere", 8), "HD72946.");
        assert_eq!(truncate("short", 8), "short");
    }

    #[test]
    fn result_list_has_one_row_per_result() {
        let config = crate::test_support::configuration("no-mass-free-ab");
        let result = crate::test_support::result_with(&config, &[(4.0, -1.0), (4.5, -0.5)]);
        let text = format_result_list(&[result]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("no-mass-free-ab"));
        assert!(lines[1].contains("completed"));
    }
}
