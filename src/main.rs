use anyhow::{Context, Result};
use bioreactor_common::{RunConfig, RunReport};
use bioreactor_engine::{run_group, FlowSnapshotSource, LoadBalancer, RunControl, SyntheticSource};
use clap::Parser;
use log::{debug, info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Command-line arguments for the engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the run configuration
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create '{}'", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)
        .with_context(|| format!("Failed to write '{}'", path.display()))?;
    info!("Report saved to {}", path.display());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting bioreactor engine...");
    let config = RunConfig::load(&args.config)?;
    let params = config.get_run_params();
    debug!("Run parameters: {:#?}", params);
    info!("Using {} Rayon threads per rank.", rayon::current_num_threads());

    let source = SyntheticSource::generate(&config.source, params.two_phase)
        .context("Failed to generate flow snapshots")?;
    let min_residence_time = source.min_residence_time();
    if params.delta_time > min_residence_time {
        warn!(
            "delta_time ({} s) exceeds the shortest residence time ({:.4} s).",
            params.delta_time, min_residence_time
        );
    }

    let balancer = LoadBalancer::from_config(&config.parallel.load_balancer, params.ranks)?;
    let control = RunControl::new();

    let start_time = Instant::now();
    let outcome = run_group(&params, &balancer, Box::new(source), &control)?;
    info!(
        "Run finished in {:.3} seconds: {} iterations, {} moves.",
        start_time.elapsed().as_secs_f64(),
        outcome.report.n_iterations,
        outcome.report.total_moves
    );

    if config.output.save_stats {
        let base = &config.output.base_filename;
        for checkpoint in &outcome.checkpoints {
            let path = PathBuf::from(format!("{}_dump_{}.json", base, checkpoint.n_iterations));
            write_report(&path, checkpoint)?;
        }
        write_report(&PathBuf::from(format!("{}_report.json", base)), &outcome.report)?;
    } else {
        info!("Skipping report as per config (save_stats is false).");
    }
    Ok(())
}
