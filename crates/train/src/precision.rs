//! Loss scaling for reduced-precision training.
//!
//! float16 gradients underflow without scaling, so the loss is multiplied by
//! a large factor before backward and the gradients divided by it afterwards.
//! The factor backs off when an overflow is seen and grows again after a run
//! of clean steps. float32 and bfloat16 use [`GradScaler::Identity`].

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Precision;
use crate::optimizer::{AdamW, Gradients};

/// Persisted part of a dynamic scaler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f64,
    pub growth_tracker: usize,
}

#[derive(Debug, Clone)]
pub struct DynamicScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
    found_inf: bool,
    unscaled: bool,
}

impl Default for DynamicScaler {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
            found_inf: false,
            unscaled: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum GradScaler {
    Identity,
    Dynamic(DynamicScaler),
}

impl GradScaler {
    /// Dynamic scaling for float16, identity otherwise. Pass the effective
    /// precision (after the CPU fallback).
    pub fn for_precision(precision: Precision) -> Self {
        match precision {
            Precision::Float16 => GradScaler::Dynamic(DynamicScaler::default()),
            Precision::Float32 | Precision::Bfloat16 => GradScaler::Identity,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, GradScaler::Dynamic(_))
    }

    pub fn scale_factor(&self) -> f64 {
        match self {
            GradScaler::Identity => 1.0,
            GradScaler::Dynamic(s) => s.scale,
        }
    }

    /// Loss multiplied by the current scale.
    pub fn scale(&self, loss: &Tensor) -> Result<Tensor> {
        match self {
            GradScaler::Identity => Ok(loss.clone()),
            GradScaler::Dynamic(s) => loss.affine(s.scale, 0.0),
        }
    }

    /// Divide gradients by the scale and record whether any overflowed.
    /// Idempotent within one step.
    pub fn unscale(&mut self, grads: &mut Gradients) -> Result<()> {
        if let GradScaler::Dynamic(s) = self {
            if s.unscaled {
                return Ok(());
            }
            grads.scale(1.0 / s.scale)?;
            s.found_inf = !grads.all_finite()?;
            s.unscaled = true;
        }
        Ok(())
    }

    /// Step the optimizer unless the gradients overflowed. Returns whether
    /// the step was taken.
    pub fn step(&mut self, optimizer: &mut AdamW, grads: &mut Gradients) -> Result<bool> {
        self.unscale(grads)?;
        if let GradScaler::Dynamic(s) = self {
            if s.found_inf {
                warn!("non-finite gradients at scale {}, skipping optimizer step", s.scale);
                return Ok(false);
            }
        }
        optimizer.step(grads)?;
        Ok(true)
    }

    /// Adjust the scale after a step and reset the per-step flags.
    pub fn update(&mut self) {
        if let GradScaler::Dynamic(s) = self {
            if s.found_inf {
                s.scale *= s.backoff_factor;
                s.growth_tracker = 0;
            } else {
                s.growth_tracker += 1;
                if s.growth_tracker == s.growth_interval {
                    s.scale *= s.growth_factor;
                    s.growth_tracker = 0;
                }
            }
            s.found_inf = false;
            s.unscaled = false;
        }
    }

    pub fn state(&self) -> Option<ScalerState> {
        match self {
            GradScaler::Identity => None,
            GradScaler::Dynamic(s) => Some(ScalerState {
                scale: s.scale,
                growth_tracker: s.growth_tracker,
            }),
        }
    }

    /// Restore a saved state. Ignored by the identity scaler.
    pub fn load_state(&mut self, state: Option<ScalerState>) {
        if let (GradScaler::Dynamic(s), Some(saved)) = (self, state) {
            s.scale = saved.scale;
            s.growth_tracker = saved.growth_tracker;
        }
    }
}
