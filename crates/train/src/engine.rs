//! One optimizer step over an accumulation window.
//!
//! Per micro-step: forward in the compute dtype, divide the loss by the window
//! length, pull the next batch, backward the (scaled) loss and add the
//! gradients. Only the last micro-step averages gradients across the group.
//! After the window: unscale, clip, step, update the scale, drop gradients.

use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Tensor};
use tracing::debug;

use forge_common::Batch;
use forge_core::{ForwardContext, LanguageModel};

use crate::collective::Collective;
use crate::optimizer::{AdamW, Gradients};
use crate::precision::GradScaler;
use crate::prefetch::BatchSource;
use crate::profiler::{Profiler, Span};

/// Outcome of one [`OptimizationEngine::accumulate_and_step`].
pub struct StepReport {
    /// Last micro-step's loss, already divided by the window length.
    pub loss: Tensor,
    pub accumulation_steps: usize,
    /// Pre-clip gradient norm; only measured when clipping is on.
    pub grad_norm: Option<f64>,
    /// False when the scaler skipped the update on overflow.
    pub stepped: bool,
}

impl StepReport {
    /// Last micro-step loss times the window length.
    ///
    /// This is the number that has always been logged as "loss"; it is not the
    /// mean over the window. Reading it forces a device sync.
    pub fn approx_total_loss(&self) -> anyhow::Result<f32> {
        Ok(self.loss.to_scalar::<f32>()? * self.accumulation_steps as f32)
    }
}

pub struct OptimizationEngine {
    optimizer: AdamW,
    scaler: GradScaler,
    grads: Gradients,
    collective: Arc<dyn Collective>,
    accumulation_steps: usize,
    grad_clip: f64,
    dtype: DType,
    /// Batch fetched during the previous micro-step, consumed by the next.
    pending: Option<Batch>,
}

impl OptimizationEngine {
    /// `accumulation_steps` is this process's share of the window.
    pub fn new(
        optimizer: AdamW,
        scaler: GradScaler,
        collective: Arc<dyn Collective>,
        accumulation_steps: usize,
        grad_clip: f64,
        dtype: DType,
    ) -> Self {
        let grads = Gradients::new(optimizer.params().len());
        Self {
            optimizer,
            scaler,
            grads,
            collective,
            accumulation_steps,
            grad_clip,
            dtype,
            pending: None,
        }
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    pub fn accumulation_steps(&self) -> usize {
        self.accumulation_steps
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    fn take_batch(&mut self, source: &mut dyn BatchSource, profiler: &mut Profiler) -> anyhow::Result<Batch> {
        if let Some(batch) = self.pending.take() {
            return Ok(batch);
        }
        let t = Instant::now();
        let batch = source.next_batch()?;
        profiler.record(Span::DataWait, t);
        Ok(batch)
    }

    pub fn accumulate_and_step(
        &mut self,
        model: &dyn LanguageModel,
        source: &mut dyn BatchSource,
        profiler: &mut Profiler,
    ) -> anyhow::Result<StepReport> {
        let n = self.accumulation_steps;
        let ctx = ForwardContext::train(self.dtype);
        let mut last_loss = None;

        for micro_step in 0..n {
            let synchronize_gradients = micro_step + 1 == n;
            let batch = self.take_batch(source, profiler)?;

            let t = Instant::now();
            let loss = model
                .loss(&batch.input, &batch.target, ctx)?
                .affine(1.0 / n as f64, 0.0)?;
            profiler.record(Span::Forward, t);

            // Next batch is prepared while backward runs.
            let t = Instant::now();
            self.pending = Some(source.next_batch()?);
            profiler.record(Span::DataWait, t);

            let t = Instant::now();
            let store = self.scaler.scale(&loss)?.backward()?;
            self.grads.accumulate(self.optimizer.params(), &store)?;
            drop(store);
            profiler.record(Span::Backward, t);

            if synchronize_gradients {
                self.synchronize(profiler)?;
            }
            last_loss = Some(loss.detach());
        }

        let t = Instant::now();
        let grad_norm = if self.grad_clip > 0.0 {
            self.scaler.unscale(&mut self.grads)?;
            Some(self.grads.clip(self.grad_clip)?)
        } else {
            None
        };
        let stepped = self.scaler.step(&mut self.optimizer, &mut self.grads)?;
        self.scaler.update();
        self.grads.clear();
        profiler.record(Span::Optimizer, t);

        let loss = last_loss.ok_or_else(|| anyhow::anyhow!("accumulation window is empty"))?;
        Ok(StepReport {
            loss,
            accumulation_steps: n,
            grad_norm,
            stepped,
        })
    }

    /// Average the accumulated gradients across the group.
    fn synchronize(&mut self, profiler: &mut Profiler) -> anyhow::Result<()> {
        if self.collective.world_size() == 1 {
            return Ok(());
        }
        let t = Instant::now();
        let params = self.optimizer.params();
        let mut flat = self.grads.flatten(params)?;
        self.collective.all_reduce_mean(&mut flat)?;
        self.grads.assign_flat(params, &flat)?;
        debug!("all-reduced {} gradient values", flat.len());
        profiler.record(Span::GradSync, t);
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
