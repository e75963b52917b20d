//! Throughput accounting and the metrics side channel.
//!
//! Model FLOPs utilisation follows the PaLM appendix B estimate:
//! `6N + 12·L·H·Q·T` FLOPs per token for forward plus backward.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use tracing::warn;

use forge_common::GptConfig;

/// Iterations to let the loop settle before measuring MFU.
const SETTLE_ITERS: usize = 5;

/// Achieved FLOPs as a fraction of `peak_flops`.
///
/// `n_params` should exclude the position embedding. `dt` is the wall time of
/// one iteration in seconds.
pub fn estimate_mfu(model_args: &GptConfig, n_params: usize, fwdbwd_per_iter: usize, dt: f64, peak_flops: f64) -> f64 {
    let n = n_params as f64;
    let l = model_args.n_layer as f64;
    let h = model_args.n_head as f64;
    let q = (model_args.n_embd / model_args.n_head.max(1)) as f64;
    let t = model_args.block_size as f64;
    let flops_per_token = 6.0 * n + 12.0 * l * h * q * t;
    let flops_per_fwdbwd = flops_per_token * t;
    let flops_per_iter = flops_per_fwdbwd * fwdbwd_per_iter as f64;
    if dt <= 0.0 || peak_flops <= 0.0 {
        return 0.0;
    }
    (flops_per_iter / dt) / peak_flops
}

/// Exponential moving average of MFU, 0.9 old / 0.1 new.
#[derive(Debug, Clone, Default)]
pub struct MfuTracker {
    running: Option<f64>,
}

impl MfuTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a measurement taken at `local_iter` (iterations run by this
    /// process so far). Early iterations are ignored.
    pub fn observe(&mut self, local_iter: usize, mfu: f64) {
        if local_iter < SETTLE_ITERS {
            return;
        }
        self.running = Some(match self.running {
            None => mfu,
            Some(r) => 0.9 * r + 0.1 * mfu,
        });
    }

    /// Whether a measurement at `local_iter` would be used.
    pub fn is_settled(local_iter: usize) -> bool {
        local_iter >= SETTLE_ITERS
    }

    pub fn running(&self) -> Option<f64> {
        self.running
    }

    /// Percent for log lines; -100 before the first measurement.
    pub fn percent(&self) -> f64 {
        self.running.unwrap_or(-1.0) * 100.0
    }
}

// ── Metrics sink ────────────────────────────────────────────────────────────

/// One evaluation's worth of metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsRecord<'a> {
    pub run: &'a str,
    pub iter: usize,
    #[serde(rename = "train/loss")]
    pub train_loss: f32,
    #[serde(rename = "val/loss")]
    pub val_loss: f32,
    pub lr: f64,
    /// Percent.
    pub mfu: f64,
}

/// External experiment tracker.
pub trait MetricsSink {
    fn log(&mut self, record: &MetricsRecord<'_>) -> anyhow::Result<()>;
}

/// Drops everything.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn log(&mut self, _record: &MetricsRecord<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlSink {
    fn log(&mut self, record: &MetricsRecord<'_>) -> anyhow::Result<()> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("opening {}", self.path.display()))?;
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(w) = self.writer.as_mut() {
            serde_json::to_writer(&mut *w, record)?;
            w.write_all(b"\n")?;
            w.flush()?;
        }
        Ok(())
    }
}

/// Send a record; failures are logged and otherwise ignored.
pub fn emit(sink: &mut dyn MetricsSink, record: &MetricsRecord<'_>) {
    if let Err(e) = sink.log(record) {
        warn!("metrics sink failed: {e:#}");
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
