//! terrasse: terrace and retaining-wall detection from an elevation GeoTIFF.
//!
//! Runs slope, break mask, vectorization, merge, export and classification
//! over one working directory and prints per-stage diagnostics. Stages whose
//! outputs are still fresh are reused; `--force` recomputes everything.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin terrasse -- [OPTIONS] <DIR>
//! ```
//!
//! `<DIR>` holds `mnt.tif` and receives `pente.tif`, `ruptures.tif` and
//! `terrasses.geojson`. Features are reprojected from the CRS declared by
//! the elevation grid to CRS84; build with `--features proj` to use the
//! PROJ library for that. Set `RUST_LOG=debug` for cache decisions and
//! GeoTIFF layout details.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use terrasse_io::runner::ELEVATION_FILE;
use terrasse_io::{RunPaths, Runner};
use terrasse_pipeline::PipelineConfig;
use terrasse_pipeline::types::VectorizePolicy;

/// Terrace and retaining-wall detection from a large elevation grid.
///
/// Reads `<DIR>/mnt.tif` (or `--elevation`) and writes the slope grid, the
/// break mask and the classified feature collection next to it.
#[derive(Parser)]
#[command(name = "terrasse", version)]
struct Cli {
    /// Working directory holding `mnt.tif`.
    dir: PathBuf,

    /// Elevation grid to read instead of `<DIR>/mnt.tif`.
    #[arg(long)]
    elevation: Option<PathBuf>,

    /// Directory for the outputs (defaults to `<DIR>`).
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Slope threshold in degrees.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_SLOPE_THRESHOLD)]
    slope_threshold: f64,

    /// Processing block side length in pixels.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_BLOCK_SIZE, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    block_size: u32,

    /// Smallest retained polygon area (square meters).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MIN_AREA)]
    min_area: f64,

    /// Largest retained polygon area (square meters).
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_MAX_AREA)]
    max_area: f64,

    /// Compactness above which a polygon is a terrace.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_COMPACTNESS_CUTOFF)]
    compactness_cutoff: f64,

    /// How tile fragments are vectorized.
    #[arg(long, value_enum, default_value_t = Policy::Organic)]
    policy: Policy,

    /// Worker threads for vectorization (0 = one per core).
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Pipeline config as a JSON file.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Recompute every stage even when its output is up to date.
    #[arg(long)]
    force: bool,

    /// Output diagnostics as JSON instead of a human-readable report.
    #[arg(long)]
    json: bool,
}

/// Vectorize policy selection.
#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    /// Closing over each tile merges nearby fragments and smooths edges.
    Organic,
    /// One polygon per connected mask region, no closing.
    Fragments,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config` is provided, the file is parsed and all individual
/// parameter flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, String> {
    if let Some(ref path) = cli.config {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
        return serde_json::from_str(&text)
            .map_err(|e| format!("Error parsing {}: {e}", path.display()));
    }

    Ok(PipelineConfig {
        slope_threshold: cli.slope_threshold,
        block_size: cli.block_size,
        min_area: cli.min_area,
        max_area: cli.max_area,
        compactness_cutoff: cli.compactness_cutoff,
        vectorize_policy: match cli.policy {
            Policy::Organic => VectorizePolicy::OrganicMerge,
            Policy::Fragments => VectorizePolicy::Fragments,
        },
        workers: cli.workers,
        ..PipelineConfig::default()
    })
}

fn runner_from_cli(cli: &Cli, config: PipelineConfig) -> Runner {
    let elevation = cli
        .elevation
        .clone()
        .unwrap_or_else(|| cli.dir.join(ELEVATION_FILE));
    let output_dir = cli.output_dir.as_deref().unwrap_or(&cli.dir);
    let paths = RunPaths::with_elevation(elevation, output_dir);
    Runner::new(paths, config).force(cli.force)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match config_from_cli(&cli).and_then(|c| {
        c.validate().map_err(|e| e.to_string())?;
        Ok(c)
    }) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };
    log::debug!("config: {config:#?}");

    let runner = runner_from_cli(&cli, config);
    if let Some(parent) = runner.paths().features.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        eprintln!("Error creating {}: {e}", parent.display());
        return ExitCode::FAILURE;
    }

    let diagnostics = match runner.run() {
        Ok(diagnostics) => diagnostics,
        Err(e) => {
            eprintln!("Run failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&diagnostics) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing diagnostics: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("{}", diagnostics.report());
    }
    eprintln!("Features written to {}", runner.paths().features.display());
    ExitCode::SUCCESS
}
