//! Learning-rate schedule: linear warmup, cosine decay, floor.

use crate::config::TrainConfig;
use crate::error::TrainError;

/// `lr(it)` as a pure function of the iteration number.
#[derive(Debug, Clone, Copy)]
pub struct LrSchedule {
    base_lr: f64,
    min_lr: f64,
    warmup_iters: usize,
    lr_decay_iters: usize,
    decay: bool,
}

impl LrSchedule {
    pub fn new(
        base_lr: f64,
        min_lr: f64,
        warmup_iters: usize,
        lr_decay_iters: usize,
        decay: bool,
    ) -> Result<Self, TrainError> {
        if decay {
            if min_lr > base_lr {
                return Err(TrainError::Config(format!(
                    "min_lr ({min_lr}) exceeds learning_rate ({base_lr})"
                )));
            }
            if lr_decay_iters <= warmup_iters {
                return Err(TrainError::Config(format!(
                    "lr_decay_iters ({lr_decay_iters}) must exceed warmup_iters ({warmup_iters})"
                )));
            }
        }
        Ok(Self {
            base_lr,
            min_lr,
            warmup_iters,
            lr_decay_iters,
            decay,
        })
    }

    pub fn from_config(config: &TrainConfig) -> Result<Self, TrainError> {
        Self::new(
            config.learning_rate,
            config.min_lr,
            config.warmup_iters,
            config.lr_decay_iters,
            config.decay_lr,
        )
    }

    /// Learning rate for iteration `it`.
    pub fn lr(&self, it: usize) -> f64 {
        if !self.decay {
            return self.base_lr;
        }
        // 1) linear warmup
        if it < self.warmup_iters {
            return self.base_lr * (it as f64 + 1.0) / (self.warmup_iters as f64 + 1.0);
        }
        // 2) past the decay horizon
        if it > self.lr_decay_iters {
            return self.min_lr;
        }
        // 3) cosine down to min_lr
        let decay_ratio = (it - self.warmup_iters) as f64 / (self.lr_decay_iters - self.warmup_iters) as f64;
        assert!((0.0..=1.0).contains(&decay_ratio), "decay ratio {decay_ratio} out of range");
        let coeff = 0.5 * (1.0 + (std::f64::consts::PI * decay_ratio).cos());
        self.min_lr + coeff * (self.base_lr - self.min_lr)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
