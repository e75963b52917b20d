use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use forge_train::checkpoint::{checkpoint_path, read_meta};
use forge_train::{DistributedContext, TrainConfig, TrainingLoop};

#[derive(Parser, Debug)]
#[command(name = "forge", about = "GPT training runs on one device or many")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train from scratch, resume from out_dir, or fine-tune pretrained weights.
    Train(TrainArgs),
    /// Print the resolved configuration as JSON and exit.
    Config(ConfigArgs),
    /// Print the metadata of a checkpoint file (or of the one in a directory).
    Inspect(InspectArgs),
}

// ── Arguments ──────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// JSON file whose keys override the defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// `key=value` overrides applied after the config file, e.g. `--set batch_size=32`.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[derive(Parser, Debug)]
struct TrainArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Record Chrome traces of a few iterations into trace_dir.
    #[arg(long)]
    enable_profiling: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Checkpoint file or an out_dir containing one.
    path: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Config(args) => cmd_config(args),
        Command::Inspect(args) => cmd_inspect(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn resolve(args: &ConfigArgs) -> Result<TrainConfig> {
    let mut config = match &args.config {
        Some(path) => TrainConfig::from_file(path)?,
        None => TrainConfig::default(),
    };
    config.apply_overrides(&args.overrides)?;
    config.validate()?;
    Ok(config)
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let config = resolve(&args.config)?;
    tracing::info!(
        out_dir = %config.out_dir.display(),
        dataset = %config.dataset,
        init_from = %config.init_from,
        "starting run"
    );
    let ctx = DistributedContext::initialize(&config).context("joining the process group")?;
    let summary = TrainingLoop::new(config, ctx, args.enable_profiling)?.run()?;
    tracing::info!(
        steps = summary.steps,
        iter_num = summary.iter_num,
        best_val_loss = summary.best_val_loss,
        checkpoints = summary.checkpoints_written,
        "run complete"
    );
    Ok(())
}

fn cmd_config(args: ConfigArgs) -> Result<()> {
    let config = resolve(&args)?;
    println!("{}", serde_json::to_string_pretty(&config.to_json()?)?);
    Ok(())
}

fn cmd_inspect(args: InspectArgs) -> Result<()> {
    let path = checkpoint_file(&args.path);
    let meta = read_meta(&path).with_context(|| format!("reading {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&meta)?);
    Ok(())
}

fn checkpoint_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        checkpoint_path(path)
    } else {
        path.to_path_buf()
    }
}
