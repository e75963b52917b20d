//! # forge-train: The Orchestrator
//!
//! Everything between a resolved [`TrainConfig`] and a finished run:
//!
//! * **[`DistributedContext`]**: rank, device and the [`Collective`] that
//!   averages gradients across processes.
//! * **[`OptimizationEngine`]**: gradient accumulation, loss scaling, clipping
//!   and the [`AdamW`] step.
//! * **[`LrSchedule`]**: linear warmup, cosine decay, floor.
//! * **[`Evaluator`]** / **[`CheckpointManager`]**: periodic loss estimates and
//!   atomic persistence of the full training state.
//! * **[`TrainingLoop`]**: drives the above and reports a [`RunSummary`].
//!
//! Profiling and metrics live in [`profiler`] and [`telemetry`].

pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod lifecycle;
pub mod optimizer;
pub mod precision;
pub mod prefetch;
pub mod profiler;
pub mod scheduler;
pub mod telemetry;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointMeta};
pub use collective::{Collective, SingleProcess, TcpCollective};
pub use config::{Backend, DeviceKind, InitFrom, Precision, TrainConfig};
pub use distributed::DistributedContext;
pub use engine::{OptimizationEngine, StepReport};
pub use error::TrainError;
pub use evaluator::Evaluator;
pub use lifecycle::{ModelState, ResumeState};
pub use optimizer::{AdamW, AdamWParams, Gradients, OptimizerState};
pub use precision::{GradScaler, ScalerState};
pub use prefetch::{BatchSource, InlineSource, Prefetcher};
pub use profiler::{ProfileSchedule, Profiler};
pub use scheduler::LrSchedule;
pub use telemetry::{estimate_mfu, JsonlSink, MetricsRecord, MetricsSink, MfuTracker, NullSink};
pub use trainer::{RunSummary, StopReason, TrainingLoop};
