//! Fatal conditions the orchestrator can name.
//!
//! Call sites wrap these in `anyhow::Error` with context; the binary prints
//! the chain and exits non-zero.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown configuration key '{0}'")]
    UnknownConfigKey(String),

    #[error("gradient_accumulation_steps ({steps}) is not divisible by world size ({world_size})")]
    AccumulationNotDivisible { steps: usize, world_size: usize },

    #[error("no checkpoint at {0}")]
    CheckpointMissing(PathBuf),

    #[error("checkpoint {path} is unreadable: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("checkpoint does not fit the model: {0}")]
    ArchitectureMismatch(String),

    #[error("unsupported collective backend '{0}' (supported: tcp)")]
    UnsupportedBackend(String),

    #[error("collective failure: {0}")]
    Collective(String),
}
