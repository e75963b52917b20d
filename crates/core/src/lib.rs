//! # forge-core: The Model Capability
//!
//! The trainer treats the network as an opaque [`LanguageModel`]: give it input
//! and target token tensors, get back a scalar loss that can be differentiated.
//! This crate also ships the reference GPT used by the `forge` binary:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`linear`] | `Linear` with autocast to the input dtype |
//! | [`norm`] | `LayerNorm` computed in f32, optional bias |
//! | [`attention`] | `CausalSelfAttention` (fused QKV) |
//! | [`mlp`] | GELU feed-forward |
//! | [`model`] | `Gpt`, `ForwardPlan`, block-size cropping |
//! | [`pretrained`] | GPT-2 family weight import |
//! | [`compiled`] | `TrainableModel` eager/compiled views and parameter naming |
//!
//! Master weights always live in f32 `Var`s. Reduced precision is applied per
//! forward pass through [`ForwardContext::dtype`].

pub mod attention;
pub mod compiled;
pub mod linear;
pub mod mlp;
pub mod model;
pub mod norm;
pub mod pretrained;

use candle_core::{DType, Result, Tensor};

use forge_common::GptConfig;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use compiled::{to_raw_name, to_trainable_name, CompiledGpt, TrainableModel, COMPILED_PREFIX};
pub use model::{ForwardPlan, Gpt};
pub use pretrained::{gpt2_family, load_pretrained};

/// Whether a forward pass is part of training (dropout active) or evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Per-call forward settings: mode and the compute dtype for matmuls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardContext {
    pub mode: Mode,
    pub dtype: DType,
}

impl ForwardContext {
    pub fn train(dtype: DType) -> Self {
        Self {
            mode: Mode::Train,
            dtype,
        }
    }

    pub fn eval(dtype: DType) -> Self {
        Self {
            mode: Mode::Eval,
            dtype,
        }
    }

    pub fn is_train(&self) -> bool {
        self.mode == Mode::Train
    }
}

/// The capability the training loop needs from a model.
pub trait LanguageModel {
    /// Mean next-token cross-entropy for `(input, targets)` as an f32 scalar.
    fn loss(&self, input: &Tensor, targets: &Tensor, ctx: ForwardContext) -> Result<Tensor>;

    /// Architecture the model was built with.
    fn config(&self) -> &GptConfig;

    /// Parameter count; `non_embedding` leaves out the position embedding.
    fn num_params(&self, non_embedding: bool) -> usize;
}
