//! Top-level application orchestration.
//!
//! `src/main.rs` stays tiny; this module is the real main:
//! - parses CLI arguments and loads the harness configuration
//! - opens the result store
//! - dispatches to the pipeline passes
//! - prints tables

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Command, CompareArgs, IngestArgs, RendererChoice, RunArgs, TagArg};
use crate::config::HarnessConfig;
use crate::derive::summarize_posterior;
use crate::error::AppError;
use crate::logging::init_logging;
use crate::plot::AsciiRenderer;
use crate::report::{ExternalRenderer, Renderer, format_report, format_result_list, format_result_summary, format_run_handles};
use crate::runner::CancelToken;
use crate::store::ResultStore;

pub mod pipeline;

/// Entry point for the `retrieve` binary.
pub fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = HarnessConfig::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store_dir = store;
    }
    let store = ResultStore::open(&config.store_dir)?;

    match cli.command {
        Command::Ingest(args) => handle_ingest(&store, args),
        Command::Run(args) => handle_run(&config, &store, args),
        Command::Compare(args) => handle_compare(config, &store, args),
        Command::List => handle_list(&store),
        Command::Show(args) => handle_show(&store, args),
        Command::Delete(args) => handle_delete(&store, args),
    }
}

fn handle_ingest(store: &ResultStore, args: IngestArgs) -> Result<(), AppError> {
    let dataset = pipeline::ingest(store, &args.dataset)?;
    println!(
        "Ingested '{}': {} points ({} spectrum instruments), distance {:.2} pc",
        dataset.object_name,
        dataset.len(),
        dataset.instruments().len(),
        dataset.distance_pc()
    );
    Ok(())
}

fn handle_run(config: &HarnessConfig, store: &ResultStore, args: RunArgs) -> Result<(), AppError> {
    let registry = pipeline::load_registry(&args.selection.manifest, args.selection.strict)?;
    let configurations = pipeline::select(&registry, &args.selection.tags)?;

    let mut settings = config.sampler.clone();
    if let Some(n) = args.live_points {
        settings.live_points = n;
    }
    if let Some(seed) = args.seed {
        settings.seed = seed;
    }
    if let Some(n) = args.max_iterations {
        settings.max_iterations = n;
    }
    if args.no_resume {
        settings.resume = false;
    }
    if args.write_partial {
        settings.write_partial_on_failure = true;
    }
    let workers = args.workers.unwrap_or(config.workers);

    let cancel = match args.stop_file {
        Some(path) => CancelToken::with_stop_file(path),
        None => CancelToken::new(),
    };

    let handles = pipeline::run_pass(config, store, &configurations, &settings, workers, &cancel)?;
    println!("{}", format_run_handles(&handles));

    let failed = handles.iter().filter(|h| !h.is_success()).count();
    if failed > 0 {
        return Err(AppError::new(
            4,
            format!("{failed} of {} runs did not complete", handles.len()),
        ));
    }
    Ok(())
}

fn handle_compare(mut config: HarnessConfig, store: &ResultStore, args: CompareArgs) -> Result<(), AppError> {
    if let Some(n) = args.teff_samples {
        config.derived.teff_samples = n;
    }
    if let Some(policy) = args.oversample {
        config.derived.oversample = policy;
    }
    let out_dir: PathBuf = args.out.clone().unwrap_or_else(|| config.output_dir.clone());
    let tags = pipeline::compare_tags(store, &args.tags, args.manifest.as_deref())?;

    let ascii = AsciiRenderer::default();
    let external = match args.renderer {
        RendererChoice::External => Some(ExternalRenderer::new(args.render_command.clone()).ok_or_else(|| {
            AppError::new(2, "--renderer external needs --render-command")
        })?),
        _ => None,
    };
    let renderer: Option<&dyn Renderer> = match args.renderer {
        RendererChoice::Ascii => Some(&ascii),
        RendererChoice::External => external.as_ref().map(|r| r as &dyn Renderer),
        RendererChoice::None => None,
    };

    let output = pipeline::compare_pass(&config, store, &tags, &out_dir, renderer)?;
    println!("{}", format_report(&output.report, args.top));
    println!("Report: {}", output.report_path.display());
    for path in &output.residual_paths {
        println!("Residuals: {}", path.display());
    }
    if let Some(figures) = &output.figures {
        println!(
            "Figures: {} written, {} failed",
            figures.written.len(),
            figures.failures()
        );
    }
    Ok(())
}

fn handle_list(store: &ResultStore) -> Result<(), AppError> {
    let results = store
        .list_tags()?
        .iter()
        .map(|tag| store.get(tag.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    if results.is_empty() {
        println!("No stored results in {}", store.root().display());
        return Ok(());
    }
    println!("{}", format_result_list(&results));
    Ok(())
}

fn handle_show(store: &ResultStore, args: TagArg) -> Result<(), AppError> {
    let result = store.get(&args.tag)?;
    println!("{}", format_result_summary(&result, &summarize_posterior(&result)));
    Ok(())
}

fn handle_delete(store: &ResultStore, args: TagArg) -> Result<(), AppError> {
    let tag = crate::domain::Tag::new(args.tag.as_str())?;
    let removed = store.delete(tag.as_str())?;
    let checkpoint = store.delete_checkpoint(&tag)?;
    info!(tag = %tag, result = removed, checkpoint, "delete");
    if removed || checkpoint {
        println!("Deleted {tag}");
    } else {
        println!("Nothing stored under {tag}");
    }
    Ok(())
}
