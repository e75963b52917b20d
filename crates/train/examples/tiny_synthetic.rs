//! Example: train a tiny GPT on a synthetic corpus, on CPU, end to end.
//!
//! Writes a repeating-pattern corpus, runs a short schedule with periodic
//! evaluation and checkpointing, then resumes from the checkpoint for a few
//! more steps.
//!
//! Run:
//!   cargo run -p forge-train --example tiny_synthetic -- --out-dir /tmp/forge-demo

use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;

use forge_common::write_token_file;
use forge_train::{DeviceKind, DistributedContext, InitFrom, Precision, TrainConfig, TrainingLoop};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "forge-demo")]
    out_dir: PathBuf,
    #[arg(long, default_value = "40")]
    max_iters: usize,
    #[arg(long)]
    enable_profiling: bool,
}

const VOCAB: u16 = 64;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let data_dir = args.out_dir.join("data/synthetic");
    std::fs::create_dir_all(&data_dir)?;

    // Arithmetic progressions mod VOCAB: learnable, but not trivially.
    let tokens: Vec<u16> = (0..20_000u32)
        .map(|i| ((i * (1 + (i / 97) % 5)) % VOCAB as u32) as u16)
        .collect();
    let split = tokens.len() * 9 / 10;
    write_token_file(&data_dir.join("train.bin"), &tokens[..split])?;
    write_token_file(&data_dir.join("val.bin"), &tokens[split..])?;
    std::fs::write(data_dir.join("meta.json"), format!(r#"{{"vocab_size": {VOCAB}}}"#))?;

    let config = TrainConfig {
        out_dir: args.out_dir.join("out"),
        data_root: args.out_dir.join("data"),
        dataset: "synthetic".into(),
        run_name: "tiny-synthetic".into(),
        metrics_log: true,
        n_layer: 2,
        n_head: 4,
        n_embd: 64,
        block_size: 32,
        batch_size: 8,
        gradient_accumulation_steps: 2,
        eval_interval: 10,
        eval_iters: 5,
        log_interval: 5,
        max_iters: args.max_iters,
        learning_rate: 3e-3,
        min_lr: 3e-4,
        warmup_iters: 5,
        lr_decay_iters: args.max_iters * 2,
        device: DeviceKind::Cpu,
        dtype: Precision::Float32,
        ..Default::default()
    };

    let ctx = DistributedContext::single(Device::Cpu, config.seed)?;
    let first = TrainingLoop::new(config.clone(), ctx, args.enable_profiling)?.run()?;
    println!(
        "first run: {} steps, best val loss {:.4}, {} checkpoints",
        first.steps, first.best_val_loss, first.checkpoints_written
    );

    let resumed = TrainConfig {
        init_from: InitFrom::Resume,
        max_iters: args.max_iters + 10,
        ..config
    };
    let ctx = DistributedContext::single(Device::Cpu, resumed.seed)?;
    let second = TrainingLoop::new(resumed, ctx, false)?.run()?;
    println!(
        "resumed at {:?}, finished at iter {}",
        second.first_completed_step, second.iter_num
    );
    Ok(())
}
