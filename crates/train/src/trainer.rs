//! The training loop: schedule, evaluate, checkpoint, step, report.
//!
//! One [`TrainingLoop`] per process. Every rank runs the same iterations with
//! the same learning rate; only the master evaluates, logs and writes
//! checkpoints.

use std::time::Instant;

use anyhow::Context;
use serde_json::Value;
use tracing::{info, warn};

use forge_common::{BatchSampler, Split, TokenCorpus};
use forge_core::LanguageModel;

use crate::checkpoint::{save_decision, Checkpoint, CheckpointManager};
use crate::config::TrainConfig;
use crate::distributed::DistributedContext;
use crate::engine::OptimizationEngine;
use crate::evaluator::Evaluator;
use crate::lifecycle::{self, ModelState};
use crate::optimizer::{named_params, AdamW, AdamWParams};
use crate::precision::GradScaler;
use crate::prefetch::{BatchSource, Prefetcher};
use crate::profiler::{ProfileSchedule, Profiler, Span};
use crate::scheduler::LrSchedule;
use crate::telemetry::{emit, estimate_mfu, JsonlSink, MetricsRecord, MetricsSink, MfuTracker, NullSink};

/// File the JSON-lines metrics sink appends to, inside `out_dir`.
pub const METRICS_FILE: &str = "metrics.jsonl";

// ── Summary ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `eval_only` run finished its single evaluation.
    EvalOnly,
    /// `iter_num` passed `max_iters`.
    MaxIters,
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    /// Optimizer steps taken by this process.
    pub steps: usize,
    /// `iter_num` after the first step of this run.
    pub first_completed_step: Option<usize>,
    pub iter_num: usize,
    pub best_val_loss: f64,
    pub checkpoints_written: usize,
    /// Last logged training loss (master only).
    pub last_loss: Option<f32>,
}

// ── Loop ────────────────────────────────────────────────────────────────────

pub struct TrainingLoop {
    config: TrainConfig,
    config_json: Value,
    ctx: DistributedContext,
    state: ModelState,
    engine: OptimizationEngine,
    schedule: LrSchedule,
    source: Box<dyn BatchSource>,
    /// Master only.
    evaluator: Option<Evaluator>,
    checkpoints: CheckpointManager,
    profiler: Profiler,
    metrics: Box<dyn MetricsSink>,
    mfu: MfuTracker,
    /// Non-embedding parameter count, for MFU.
    n_params: usize,
}

/// Everything a run owns besides its config and distributed context.
struct Parts {
    config_json: Value,
    state: ModelState,
    engine: OptimizationEngine,
    schedule: LrSchedule,
    source: Box<dyn BatchSource>,
    evaluator: Option<Evaluator>,
    checkpoints: CheckpointManager,
    profiler: Profiler,
    metrics: Box<dyn MetricsSink>,
    n_params: usize,
}

impl Parts {
    fn build(config: &TrainConfig, ctx: &DistributedContext, enable_profiling: bool) -> anyhow::Result<Self> {
        config.validate()?;
        let schedule = LrSchedule::from_config(config)?;
        let accumulation = ctx.per_process_accumulation(config.gradient_accumulation_steps)?;
        info!(
            "tokens per iteration will be: {}",
            ctx.tokens_per_iteration(accumulation, config.batch_size, config.block_size)
        );

        if ctx.is_master() {
            std::fs::create_dir_all(&config.out_dir)
                .with_context(|| format!("creating {}", config.out_dir.display()))?;
        }

        let device = ctx.device().clone();
        let precision = config.dtype.effective(&device);
        let dtype = config.dtype.compute_dtype(&device);
        if precision != config.dtype {
            info!("{:?} requested but {device:?} computes in {precision:?}", config.dtype);
        }

        let built = lifecycle::build(config, &device)?;
        let state = built.state;

        let hp = AdamWParams {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(named_params(&state.varmap)?, hp)?;
        let mut scaler = GradScaler::for_precision(precision);
        if let Some(resume) = built.resume {
            optimizer
                .load_state(&resume.optimizer)
                .context("restoring optimizer state")?;
            scaler.load_state(resume.grad_scaler);
        }
        let engine = OptimizationEngine::new(
            optimizer,
            scaler,
            ctx.collective_handle(),
            accumulation,
            config.grad_clip,
            dtype,
        );

        let block_size = state.model_args.block_size;
        if block_size != config.block_size {
            warn!(
                "model context is {block_size}, sampling windows of {block_size} instead of {}",
                config.block_size
            );
        }
        let corpus = TokenCorpus::new(config.data_dir());
        let sampler = BatchSampler::new(corpus.clone(), config.batch_size, block_size, ctx.seed());
        for split in Split::ALL {
            let tokens = sampler.check(split)?;
            info!("{} split: {tokens} tokens", split.as_str());
        }
        let source: Box<dyn BatchSource> = Box::new(Prefetcher::spawn(sampler, Split::Train, device.clone()));

        let evaluator = ctx.is_master().then(|| {
            Evaluator::new(
                corpus,
                config.batch_size,
                block_size,
                ctx.seed(),
                config.eval_iters,
                dtype,
                device.clone(),
            )
        });

        let profiler = if enable_profiling {
            Profiler::new(config.trace_dir(), ctx.rank(), ProfileSchedule::default())
        } else {
            Profiler::disabled()
        };
        let metrics: Box<dyn MetricsSink> = if config.metrics_log && ctx.is_master() {
            Box::new(JsonlSink::new(config.out_dir.join(METRICS_FILE)))
        } else {
            Box::new(NullSink)
        };

        Ok(Self {
            config_json: config.to_json()?,
            checkpoints: CheckpointManager::new(config.out_dir.clone(), ctx.is_master()),
            n_params: state.model.num_params(true),
            state,
            engine,
            schedule,
            source,
            evaluator,
            profiler,
            metrics,
        })
    }
}

impl TrainingLoop {
    /// Build every component of a run. Nothing is trained yet. If setup
    /// fails the group is released before the error is returned.
    pub fn new(config: TrainConfig, ctx: DistributedContext, enable_profiling: bool) -> anyhow::Result<Self> {
        let parts = match Parts::build(&config, &ctx, enable_profiling) {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(release) = ctx.shutdown() {
                    warn!("releasing the group after a failed start: {release}");
                }
                return Err(e);
            }
        };
        let Parts {
            config_json,
            state,
            engine,
            schedule,
            source,
            evaluator,
            checkpoints,
            profiler,
            metrics,
            n_params,
        } = parts;
        Ok(Self {
            config,
            config_json,
            ctx,
            state,
            engine,
            schedule,
            source,
            evaluator,
            checkpoints,
            profiler,
            metrics,
            mfu: MfuTracker::new(),
            n_params,
        })
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    /// Run to completion, then stop the profiler and leave the group. Teardown
    /// happens on error exits too; the first error wins.
    pub fn run(mut self) -> anyhow::Result<RunSummary> {
        let result = self.iterate();
        let TrainingLoop {
            mut profiler,
            ctx,
            source,
            ..
        } = self;
        drop(source);
        let stopped = profiler.stop();
        let released = ctx.shutdown();

        let summary = result?;
        stopped?;
        released?;
        info!(
            "finished at iter {} after {} steps ({:?})",
            summary.iter_num, summary.steps, summary.stop_reason
        );
        Ok(summary)
    }

    fn iterate(&mut self) -> anyhow::Result<RunSummary> {
        let fwdbwd_per_iter = self.config.batch_size * self.engine.accumulation_steps();
        let mut local_iter = 0usize;
        let mut first_completed_step = None;
        let mut checkpoints_written = 0usize;
        let mut last_loss = None;
        let mut t0 = Instant::now();

        let stop_reason = loop {
            let iter_start = Instant::now();
            let iter_num = self.state.iter_num;
            self.engine.set_learning_rate(self.schedule.lr(iter_num));

            if iter_num % self.config.eval_interval == 0 && self.ctx.is_master() && self.evaluate()? {
                checkpoints_written += 1;
            }
            if iter_num == 0 && self.config.eval_only {
                break StopReason::EvalOnly;
            }

            let report = self
                .engine
                .accumulate_and_step(&self.state.model, self.source.as_mut(), &mut self.profiler)?;

            let t1 = Instant::now();
            let dt = t1.duration_since(t0).as_secs_f64();
            t0 = t1;

            if iter_num % self.config.log_interval == 0 && self.ctx.is_master() {
                // Forces a device sync.
                let lossf = report.approx_total_loss()?;
                if MfuTracker::is_settled(local_iter) {
                    let mfu = estimate_mfu(
                        &self.state.model_args,
                        self.n_params,
                        fwdbwd_per_iter,
                        dt,
                        self.config.peak_flops,
                    );
                    self.mfu.observe(local_iter, mfu);
                }
                info!(
                    "iter {iter_num}: loss {lossf:.4}, time {:.2}ms, mfu {:.2}%",
                    dt * 1000.0,
                    self.mfu.percent()
                );
                if !report.stepped {
                    warn!("iter {iter_num}: non-finite gradients, update skipped");
                }
                last_loss = Some(lossf);
            }

            self.profiler.record(Span::Iteration, iter_start);
            self.profiler.step()?;

            self.state.iter_num += 1;
            local_iter += 1;
            first_completed_step.get_or_insert(self.state.iter_num);

            if self.state.iter_num > self.config.max_iters {
                break StopReason::MaxIters;
            }
        };

        Ok(RunSummary {
            stop_reason,
            steps: local_iter,
            first_completed_step,
            iter_num: self.state.iter_num,
            best_val_loss: self.state.best_val_loss,
            checkpoints_written,
            last_loss,
        })
    }

    /// Estimate losses, report them and maybe checkpoint. Returns whether a
    /// checkpoint was written.
    fn evaluate(&mut self) -> anyhow::Result<bool> {
        let Some(evaluator) = self.evaluator.as_mut() else {
            return Ok(false);
        };
        let iter_num = self.state.iter_num;

        let t = Instant::now();
        let losses = evaluator.evaluate(&self.state.model, &Split::ALL)?;
        self.profiler.record(Span::Evaluate, t);

        let train_loss = losses.get(&Split::Train).copied().unwrap_or(f32::NAN);
        let val_loss = losses.get(&Split::Val).copied().unwrap_or(f32::NAN);
        info!("step {iter_num}: train loss {train_loss:.4}, val loss {val_loss:.4}");

        let record = MetricsRecord {
            run: &self.config.run_name,
            iter: iter_num,
            train_loss,
            val_loss,
            lr: self.engine.optimizer().learning_rate(),
            mfu: self.mfu.percent(),
        };
        emit(self.metrics.as_mut(), &record);

        let decision = save_decision(
            iter_num,
            val_loss as f64,
            self.state.best_val_loss,
            self.config.always_save_checkpoint,
        );
        self.state.best_val_loss = decision.best_val_loss;
        if !decision.write {
            return Ok(false);
        }

        let checkpoint = Checkpoint::capture(
            &self.state.varmap,
            self.engine.optimizer(),
            self.engine.scaler(),
            &self.state.model_args,
            iter_num,
            self.state.best_val_loss,
            self.config_json.clone(),
        )?;
        info!("saving checkpoint to {}", self.checkpoints.dir().display());
        let written = self
            .checkpoints
            .save(&checkpoint)
            .with_context(|| format!("writing checkpoint at iter {iter_num}"))?;
        Ok(written.is_some())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{checkpoint_path, read_meta, INITIAL_BEST_VAL_LOSS};
    use crate::config::{DeviceKind, InitFrom, Precision};
    use candle_core::Device;
    use forge_common::write_token_file;

    fn tiny(dir: &std::path::Path) -> TrainConfig {
        let data = dir.join("data/tiny");
        std::fs::create_dir_all(&data).unwrap();
        let tokens: Vec<u16> = (0..600).map(|i| ((i * 5 + i / 7) % 32) as u16).collect();
        write_token_file(&data.join("train.bin"), &tokens).unwrap();
        write_token_file(&data.join("val.bin"), &tokens[..300]).unwrap();
        std::fs::write(data.join("meta.json"), r#"{"vocab_size": 32}"#).unwrap();
        TrainConfig {
            out_dir: dir.join("out"),
            data_root: dir.join("data"),
            dataset: "tiny".into(),
            n_layer: 1,
            n_head: 2,
            n_embd: 16,
            block_size: 8,
            batch_size: 2,
            gradient_accumulation_steps: 2,
            eval_interval: 2,
            eval_iters: 2,
            max_iters: 3,
            learning_rate: 1e-3,
            min_lr: 1e-4,
            warmup_iters: 1,
            lr_decay_iters: 10,
            device: DeviceKind::Cpu,
            dtype: Precision::Float32,
            compile: false,
            ..Default::default()
        }
    }

    fn run(config: TrainConfig, profiling: bool) -> RunSummary {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let ctx = DistributedContext::single(Device::Cpu, config.seed).unwrap();
        TrainingLoop::new(config, ctx, profiling).unwrap().run().unwrap()
    }

    #[test]
    fn fresh_run_stops_after_max_iters() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny(dir.path());
        let summary = run(config.clone(), false);

        assert_eq!(summary.stop_reason, StopReason::MaxIters);
        assert_eq!(summary.steps, 4);
        assert_eq!(summary.first_completed_step, Some(1));
        assert_eq!(summary.iter_num, 4);
        // Evaluations at 0 and 2; nothing is written at 0.
        assert_eq!(summary.checkpoints_written, 1);
        assert!(summary.best_val_loss < INITIAL_BEST_VAL_LOSS);
        assert!(summary.last_loss.unwrap().is_finite());

        let meta = read_meta(&checkpoint_path(&config.out_dir)).unwrap();
        assert_eq!(meta.iter_num, 2);
        assert_eq!(meta.model_args.vocab_size, 32);
        assert_eq!(meta.optimizer_step, 2);
    }

    #[test]
    fn eval_only_makes_a_single_pass_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig {
            eval_only: true,
            metrics_log: true,
            ..tiny(dir.path())
        };
        let summary = run(config.clone(), false);

        assert_eq!(summary.stop_reason, StopReason::EvalOnly);
        assert_eq!(summary.steps, 0);
        assert_eq!(summary.first_completed_step, None);
        assert_eq!(summary.iter_num, 0);
        assert_eq!(summary.checkpoints_written, 0);
        assert!(!checkpoint_path(&config.out_dir).exists());

        let metrics = std::fs::read_to_string(config.out_dir.join(METRICS_FILE)).unwrap();
        let lines: Vec<Value> = metrics
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["iter"], 0);
        assert_eq!(lines[0]["run"], "gpt2");
    }

    #[test]
    fn resume_continues_from_the_saved_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let base = tiny(dir.path());

        // Seed out_dir with a checkpoint claiming 5000 completed steps.
        let built = lifecycle::build(&base, &Device::Cpu).unwrap();
        let opt = AdamW::new(named_params(&built.state.varmap).unwrap(), AdamWParams::default()).unwrap();
        let ckpt = Checkpoint::capture(
            &built.state.varmap,
            &opt,
            &GradScaler::Identity,
            &built.state.model_args,
            5000,
            0.0,
            Value::Null,
        )
        .unwrap();
        CheckpointManager::new(&base.out_dir, true).save(&ckpt).unwrap();

        let config = TrainConfig {
            init_from: InitFrom::Resume,
            always_save_checkpoint: false,
            eval_interval: 1000,
            max_iters: 5001,
            ..base
        };
        let summary = run(config.clone(), false);

        assert_eq!(summary.first_completed_step, Some(5001));
        assert_eq!(summary.steps, 2);
        assert_eq!(summary.iter_num, 5002);
        // A best of 0.0 cannot be beaten, so nothing is rewritten.
        assert_eq!(summary.best_val_loss, 0.0);
        assert_eq!(summary.checkpoints_written, 0);
        assert_eq!(read_meta(&checkpoint_path(&config.out_dir)).unwrap().iter_num, 5000);
    }

    #[test]
    fn resume_with_smaller_block_size_keeps_training() {
        let dir = tempfile::tempdir().unwrap();
        let base = tiny(dir.path());
        run(base.clone(), false);
        assert_eq!(read_meta(&checkpoint_path(&base.out_dir)).unwrap().iter_num, 2);

        let config = TrainConfig {
            init_from: InitFrom::Resume,
            block_size: 4,
            max_iters: 4,
            ..base
        };
        let summary = run(config.clone(), false);
        assert_eq!(summary.first_completed_step, Some(3));
        assert_eq!(summary.iter_num, 5);
        assert!(summary.last_loss.unwrap().is_finite());

        let meta = read_meta(&checkpoint_path(&config.out_dir)).unwrap();
        assert_eq!(meta.iter_num, 4);
        assert_eq!(meta.model_args.block_size, 4);
    }

    #[test]
    fn profiling_writes_traces_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny(dir.path());
        run(config.clone(), true);

        let traces: Vec<_> = std::fs::read_dir(config.trace_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .collect();
        assert!(!traces.is_empty());
    }

    #[test]
    fn invalid_config_is_rejected_before_building() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig {
            batch_size: 0,
            ..tiny(dir.path())
        };
        let ctx = DistributedContext::single(Device::Cpu, 1337).unwrap();
        assert!(TrainingLoop::new(config, ctx, false).is_err());
    }
}
