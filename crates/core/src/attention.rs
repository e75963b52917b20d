//! Causal self-attention with a fused QKV projection.
//!
//! Parameter layout follows the GPT-2 checkpoints: `c_attn` produces
//! `[q | k | v]` along the last dimension and `c_proj` mixes the heads back.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::VarBuilder;

use forge_common::GptConfig;

use crate::linear::Linear;
use crate::ForwardContext;

/// Additive mask of shape `(1, 1, t, t)`: 0 on and below the diagonal, -1e9 above.
pub fn causal_mask(t: usize, device: &candle_core::Device) -> Result<Tensor> {
    let lower = Tensor::tril2(t, DType::F32, device)?;
    let ones = Tensor::ones((t, t), DType::F32, device)?;
    let blocked = (&ones - &lower)?;
    blocked.affine(-1e9, 0.0)?.reshape((1, 1, t, t))
}

pub(crate) fn dropout(x: &Tensor, p: f64, ctx: ForwardContext) -> Result<Tensor> {
    if ctx.is_train() && p > 0.0 {
        candle_nn::ops::dropout(x, p as f32)
    } else {
        Ok(x.clone())
    }
}

pub struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
    scale: f64,
    dropout: f64,
}

impl CausalSelfAttention {
    pub fn new(config: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let n_embd = config.n_embd;
        let head_dim = config
            .head_dim()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        // Residual projections get the depth-scaled init.
        let proj_std = 0.02 / (2.0 * config.n_layer as f64).sqrt();
        let c_attn = Linear::new(n_embd, 3 * n_embd, config.bias, 0.02, vb.pp("c_attn"))?;
        let c_proj = Linear::new(n_embd, n_embd, config.bias, proj_std, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
            dropout: config.dropout,
        })
    }

    pub fn num_params(&self) -> usize {
        self.c_attn.num_params() + self.c_proj.num_params()
    }

    /// `x`: `(b, t, c)` in the compute dtype. `mask` from [`causal_mask`] for `t`.
    pub fn forward(&self, x: &Tensor, mask: &Tensor, ctx: ForwardContext) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let qkv = self.c_attn.forward(x)?;
        let heads = |i: usize| -> Result<Tensor> {
            qkv.narrow(2, i * c, c)?
                .reshape((b, t, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = heads(0)?;
        let k = heads(1)?;
        let v = heads(2)?;

        let scores = q.matmul(&k.t()?)?.affine(self.scale, 0.0)?;
        let scores = scores.to_dtype(DType::F32)?.broadcast_add(mask)?;
        let att = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(x.dtype())?;
        let att = dropout(&att, self.dropout, ctx)?;

        let y = att.matmul(&v)?;
        let y = y.transpose(1, 2)?.reshape((b, t, c))?;
        let y = self.c_proj.forward(&y)?;
        dropout(&y, self.dropout, ctx)
    }
}
