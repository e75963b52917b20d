//! Position-wise feed-forward: `c_fc` (4× width) → GELU → `c_proj`.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use forge_common::GptConfig;

use crate::attention::dropout;
use crate::linear::Linear;
use crate::ForwardContext;

pub struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
    dropout: f64,
}

impl Mlp {
    pub fn new(config: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = 4 * config.n_embd;
        let proj_std = 0.02 / (2.0 * config.n_layer as f64).sqrt();
        Ok(Self {
            c_fc: Linear::new(config.n_embd, hidden, config.bias, 0.02, vb.pp("c_fc"))?,
            c_proj: Linear::new(hidden, config.n_embd, config.bias, proj_std, vb.pp("c_proj"))?,
            dropout: config.dropout,
        })
    }

    pub fn num_params(&self) -> usize {
        self.c_fc.num_params() + self.c_proj.num_params()
    }

    pub fn forward(&self, x: &Tensor, ctx: ForwardContext) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?.gelu_erf()?;
        let y = self.c_proj.forward(&h)?;
        dropout(&y, self.dropout, ctx)
    }
}
