//! CLI command definitions for vbm_forge.
//!
//! `run` processes a batch, `similarity` scores a single pair of volumes
//! and `check-config` validates a configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use crate::engine::{CommandEngine, StructuralEngine};
use crate::metrics::{init_metrics, write_metrics};
use crate::pipeline::{BatchOrchestrator, DataSource, QcProfile, RunConfig, SmoothingKernel};
use crate::quality::{compute_similarity, format_score};
use crate::volume::Volume;

/// Batch voxel-based morphometry preprocessing with quality control.
#[derive(Parser)]
#[command(name = "vbm-forge")]
#[command(about = "Batch VBM preprocessing with quality control and regression manifests")]
#[command(version)]
#[command(
    long_about = "vbm-forge runs structural MRI scans through segmentation, normalization and smoothing, \
scores each result against a reference template and curates the subjects that pass into a regression manifest.\n\n\
Example usage:\n  vbm-forge run --config vbm.yaml --data /data/bids --output /data/out --fwhm 8"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Preprocess a batch of subjects.
    Run(RunArgs),

    /// Score a candidate volume against a reference volume.
    #[command(alias = "corr")]
    Similarity(SimilarityArgs),

    /// Load, override and validate a configuration, then print it.
    CheckConfig(CheckConfigArgs),
}

/// Arguments for `vbm-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// BIDS dataset root, overriding the configured data source.
    #[arg(short, long)]
    pub data: Option<PathBuf>,

    /// Output directory.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Smoothing kernel FWHM in mm: one width or three comma-separated widths.
    #[arg(long)]
    pub fwhm: Option<SmoothingKernel>,

    /// QC pass threshold in [0, 1].
    #[arg(long, conflicts_with = "qc_profile")]
    pub threshold: Option<f64>,

    /// Named QC threshold preset (adult, developmental).
    #[arg(long)]
    pub qc_profile: Option<QcProfile>,

    /// JSON covariates table; subjects are taken from its file column.
    #[arg(long)]
    pub covariates: Option<PathBuf>,

    /// Write Prometheus metrics to this file after the run.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,

    /// Print compact JSON instead of pretty JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `vbm-forge similarity`.
#[derive(Parser, Debug)]
pub struct SimilarityArgs {
    /// Reference volume (for example the tissue probability map).
    pub reference: PathBuf,

    /// Candidate volume (for example `swc1Re.nii`).
    pub candidate: PathBuf,
}

/// Arguments for `vbm-forge check-config`.
#[derive(Parser, Debug)]
pub struct CheckConfigArgs {
    /// YAML configuration file.
    pub file: PathBuf,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_batch_command(args).await,
        Commands::Similarity(args) => run_similarity_command(args),
        Commands::CheckConfig(args) => run_check_config_command(args),
    }
}

/// Builds the final run configuration: file, then environment, then flags.
fn build_config(args: &RunArgs) -> anyhow::Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?,
        None => RunConfig::default(),
    };
    config.apply_env_overrides()?;

    if let Some(root) = &args.data {
        config = config.with_bids_root(root);
    }
    if let Some(output) = &args.output {
        config = config.with_output_dir(output);
    }
    if let Some(kernel) = args.fwhm {
        config = config.with_smoothing(kernel);
    }
    if let Some(profile) = args.qc_profile {
        config = config.with_qc_profile(profile);
    }
    if let Some(threshold) = args.threshold {
        config = config.with_pass_threshold(threshold);
    }
    if let Some(covariates) = &args.covariates {
        config = config.with_covariates(covariates);
    }

    config.validate()?;
    Ok(config)
}

async fn run_batch_command(args: RunArgs) -> anyhow::Result<()> {
    let config = build_config(&args)?;

    if args.metrics_out.is_some() {
        init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;
    }

    if let DataSource::Bids { root, .. } = &config.data {
        info!(root = %root.display(), "Using BIDS data source");
    }

    let engine: Arc<dyn StructuralEngine> = Arc::new(CommandEngine::new(config.engine.clone()));
    let orchestrator = BatchOrchestrator::new(config, engine);

    let cancellation = orchestrator.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current subject before stopping");
            cancellation.cancel();
        }
    });

    let payload = orchestrator.run().await?;

    if let Some(path) = &args.metrics_out {
        write_metrics(path)
            .map_err(|e| anyhow::anyhow!("Failed to write metrics to {}: {}", path.display(), e))?;
    }

    let json_output = if args.json {
        serde_json::to_string(&payload)
    } else {
        serde_json::to_string_pretty(&payload)
    }
    .map_err(|e| anyhow::anyhow!("Failed to serialize payload: {}", e))?;
    println!("{}", json_output);

    Ok(())
}

fn run_similarity_command(args: SimilarityArgs) -> anyhow::Result<()> {
    let reference = open_volume(&args.reference)?;
    let candidate = open_volume(&args.candidate)?;
    let score = compute_similarity(&reference, &candidate)
        .map_err(|e| anyhow::anyhow!("Similarity undefined: {}", e))?;
    print!("{}", format_score(score));
    Ok(())
}

fn open_volume(path: &Path) -> anyhow::Result<Volume> {
    Volume::open(path).map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))
}

fn run_check_config_command(args: CheckConfigArgs) -> anyhow::Result<()> {
    let mut config = RunConfig::load(&args.file)
        .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", args.file.display(), e))?;
    config.apply_env_overrides()?;
    config.validate()?;

    let yaml = serde_yaml::to_string(&config)
        .map_err(|e| anyhow::anyhow!("Failed to serialize configuration: {}", e))?;
    print!("{}", yaml);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_flags() {
        let args = vec![
            "vbm-forge", "run", "--data", "/data/bids", "--output", "/data/out", "--fwhm", "8,8,10",
            "--qc-profile", "adult",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.data, Some(PathBuf::from("/data/bids")));
                assert_eq!(args.fwhm, Some(SmoothingKernel::PerAxis([8.0, 8.0, 10.0])));
                assert_eq!(args.qc_profile, Some(QcProfile::Adult));
                assert!(args.config.is_none());
                assert!(!args.json);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_threshold_conflicts_with_profile() {
        let args = vec![
            "vbm-forge", "run", "--threshold", "0.8", "--qc-profile", "adult",
        ];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_build_config_applies_flags() {
        let cli = Cli::try_parse_from(vec![
            "vbm-forge", "run", "--data", "/data/bids", "--fwhm", "6", "--threshold", "0.85",
        ])
        .expect("should parse");
        let Commands::Run(args) = cli.command else {
            panic!("Expected Run command");
        };

        let config = build_config(&args).unwrap();
        assert_eq!(config.smoothing.fwhm(), [6.0, 6.0, 6.0]);
        assert!((config.qc.pass_threshold - 0.85).abs() < f64::EPSILON);
        assert!(matches!(config.data, DataSource::Bids { .. }));
    }

    #[test]
    fn test_build_config_rejects_bad_threshold() {
        let cli = Cli::try_parse_from(vec!["vbm-forge", "run", "--threshold", "1.5"])
            .expect("should parse");
        let Commands::Run(args) = cli.command else {
            panic!("Expected Run command");
        };
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_similarity_and_check_config_parse() {
        let cli = Cli::try_parse_from(vec!["vbm-forge", "corr", "a.nii", "b.nii"]).unwrap();
        assert!(matches!(cli.command, Commands::Similarity(_)));

        let cli = Cli::try_parse_from(vec!["vbm-forge", "check-config", "vbm.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckConfig(_)));
    }
}
