//! Command-line parsing for the retrieval harness.
//!
//! Argument parsing and command dispatch stay separate from the sampling and
//! derivation code. The three passes of a study map onto `ingest`, `run` and
//! `compare`; `list`, `show` and `delete` inspect the store.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::derive::OversamplePolicy;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "retrieve",
    version,
    about = "Multi-configuration atmospheric retrieval harness"
)]
pub struct Cli {
    /// Harness configuration file (defaults to ./harness.toml when present).
    #[arg(long, global = true, value_name = "TOML")]
    pub config: Option<PathBuf>,

    /// Result store directory (overrides config and RETRIEVAL_STORE_DIR).
    #[arg(long, global = true, value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// Debug logging for this crate (RUST_LOG still wins).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Read a dataset manifest and store the dataset for later passes.
    Ingest(IngestArgs),
    /// Run retrievals for every configuration in a manifest (or selected tags).
    Run(RunArgs),
    /// Derive quantities, print the comparison, write report/exports/figures.
    Compare(CompareArgs),
    /// List stored results.
    List,
    /// Show one stored result.
    Show(TagArg),
    /// Delete a stored result and its checkpoint.
    Delete(TagArg),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Dataset manifest (TOML) naming the object, parallax and data files.
    #[arg(long, value_name = "TOML")]
    pub dataset: PathBuf,
}

/// Which configurations a pass covers.
#[derive(Debug, Args, Clone)]
pub struct Selection {
    /// Configuration manifest.
    #[arg(long, value_name = "TOML", default_value = "retrievals.toml")]
    pub manifest: PathBuf,

    /// Restrict to these tags (repeatable). Default: every tag in the manifest.
    #[arg(short, long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    /// Fail on duplicate tags in the manifest instead of keeping the last one.
    #[arg(long)]
    pub strict: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: Selection,

    /// Concurrent runs.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Live points per run.
    #[arg(long)]
    pub live_points: Option<usize>,

    /// Ignore existing checkpoints and start fresh.
    #[arg(long)]
    pub no_resume: bool,

    /// Store the partial posterior when a run fails.
    #[arg(long)]
    pub write_partial: bool,

    /// Sampler seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Iteration cap per run.
    #[arg(long)]
    pub max_iterations: Option<u64>,

    /// Cancel every run once this file exists; checkpoints are kept.
    #[arg(long, value_name = "PATH")]
    pub stop_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RendererChoice {
    /// Text spectrum previews only.
    Ascii,
    /// Delegate every figure to `--render-command`.
    External,
    /// No figures.
    None,
}

#[derive(Debug, Args)]
pub struct CompareArgs {
    /// Manifest whose tags are compared; without it, every stored result.
    #[arg(long, value_name = "TOML")]
    pub manifest: Option<PathBuf>,

    /// Compare exactly these tags, in this order (repeatable).
    #[arg(short, long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    /// Output root for report, residual exports and figures.
    #[arg(long, value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Posterior draws used for Teff.
    #[arg(long)]
    pub teff_samples: Option<usize>,

    /// What to do when more draws are requested than stored samples.
    #[arg(long, value_enum)]
    pub oversample: Option<OversamplePolicy>,

    #[arg(long, value_enum, default_value_t = RendererChoice::Ascii)]
    pub renderer: RendererChoice,

    /// Plotting command for `--renderer external` (repeat for arguments).
    #[arg(long = "render-command", value_name = "ARG", allow_hyphen_values = true)]
    pub render_command: Vec<String>,

    /// Largest deviations listed per tag.
    #[arg(long, default_value_t = 5)]
    pub top: usize,
}

#[derive(Debug, Args)]
pub struct TagArg {
    pub tag: String,
}
