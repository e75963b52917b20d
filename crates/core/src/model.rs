//! GPT decoder: token + position embeddings, pre-norm blocks, tied LM head.
//!
//! Parameter names follow the GPT-2 layout (`transformer.wte.weight`,
//! `transformer.h.{i}.attn.c_attn.weight`, ...) so pretrained weights and
//! checkpoints map one to one onto the `VarMap`.

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{Embedding, Init, Module, VarBuilder, VarMap};

use forge_common::GptConfig;

use crate::attention::{causal_mask, dropout, CausalSelfAttention};
use crate::mlp::Mlp;
use crate::norm::LayerNorm;
use crate::{ForwardContext, LanguageModel};

/// `VarMap` key of the position embedding table.
pub const WPE_NAME: &str = "transformer.wpe.weight";

const EMBEDDING_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.02,
};

// ── Forward plan ────────────────────────────────────────────────────────────

/// Sequence-length dependent tensors reused by every layer of one forward pass.
#[derive(Clone)]
pub struct ForwardPlan {
    seq_len: usize,
    mask: Tensor,
    positions: Tensor,
}

impl ForwardPlan {
    pub fn new(seq_len: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            seq_len,
            mask: causal_mask(seq_len, device)?,
            positions: Tensor::arange(0u32, seq_len as u32, device)?,
        })
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }
}

// ── Block ───────────────────────────────────────────────────────────────────

/// `x + attn(ln_1(x))`, then `x + mlp(ln_2(x))`.
struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(config: &GptConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: LayerNorm::new(config.n_embd, config.bias, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::new(config, vb.pp("attn"))?,
            ln_2: LayerNorm::new(config.n_embd, config.bias, vb.pp("ln_2"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
        })
    }

    fn num_params(&self) -> usize {
        self.ln_1.num_params() + self.attn.num_params() + self.ln_2.num_params() + self.mlp.num_params()
    }

    fn forward(&self, x: &Tensor, mask: &Tensor, ctx: ForwardContext) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?, mask, ctx)?)?;
        &x + self.mlp.forward(&self.ln_2.forward(&x)?, ctx)?
    }
}

// ── Gpt ─────────────────────────────────────────────────────────────────────

/// Decoder-only transformer. The output projection reuses `wte`.
pub struct Gpt {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    config: GptConfig,
    device: Device,
}

impl Gpt {
    pub fn new(vb: VarBuilder, config: &GptConfig) -> Result<Self> {
        let vb = vb.pp("transformer");
        let wte = vb
            .pp("wte")
            .get_with_hints((config.vocab_size, config.n_embd), "weight", EMBEDDING_INIT)?;
        let wpe = vb
            .pp("wpe")
            .get_with_hints((config.block_size, config.n_embd), "weight", EMBEDDING_INIT)?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::new(config, vb.pp(format!("h.{i}")))?);
        }
        let ln_f = LayerNorm::new(config.n_embd, config.bias, vb.pp("ln_f"))?;

        Ok(Self {
            wte: Embedding::new(wte, config.n_embd),
            wpe: Embedding::new(wpe, config.n_embd),
            blocks,
            ln_f,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Logits `(b, t, vocab)` in the compute dtype.
    pub fn logits_with_plan(&self, input: &Tensor, ctx: ForwardContext, plan: &ForwardPlan) -> Result<Tensor> {
        let (b, t) = input.dims2()?;
        if t > self.config.block_size {
            return Err(candle_core::Error::Msg(format!(
                "sequence length {t} exceeds block size {}",
                self.config.block_size
            )));
        }
        if plan.seq_len != t {
            return Err(candle_core::Error::Msg(format!(
                "forward plan built for length {}, got {t}",
                plan.seq_len
            )));
        }

        let tok = self.wte.forward(input)?;
        let pos = self.wpe.forward(&plan.positions)?;
        let x = tok.broadcast_add(&pos)?.to_dtype(ctx.dtype)?;
        let mut x = dropout(&x, self.config.dropout, ctx)?;
        for block in &self.blocks {
            x = block.forward(&x, &plan.mask, ctx)?;
        }
        let x = self.ln_f.forward(&x)?;

        let head = self.wte.embeddings().to_dtype(x.dtype())?;
        let logits = x.reshape((b * t, self.config.n_embd))?.matmul(&head.t()?)?;
        logits.reshape((b, t, self.config.vocab_size))
    }

    /// Cross-entropy against `targets`, computed in f32.
    pub fn loss_with_plan(
        &self,
        input: &Tensor,
        targets: &Tensor,
        ctx: ForwardContext,
        plan: &ForwardPlan,
    ) -> Result<Tensor> {
        let logits = self.logits_with_plan(input, ctx, plan)?;
        let (b, t, v) = logits.dims3()?;
        let logits = logits.to_dtype(DType::F32)?.reshape((b * t, v))?;
        let targets = targets.reshape(b * t)?;
        candle_nn::loss::cross_entropy(&logits, &targets)
    }

    /// Shrink the context window to `block_size` by truncating the position
    /// embedding. The truncated table replaces the old entry in `varmap`.
    pub fn crop_block_size(&mut self, varmap: &VarMap, block_size: usize) -> Result<()> {
        if block_size > self.config.block_size {
            return Err(candle_core::Error::Msg(format!(
                "cannot crop block size {} up to {block_size}",
                self.config.block_size
            )));
        }
        if block_size == self.config.block_size {
            return Ok(());
        }
        let cropped = self.wpe.embeddings().narrow(0, 0, block_size)?.contiguous()?;
        let var = Var::from_tensor(&cropped)?;
        varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".into()))?
            .insert(WPE_NAME.to_string(), var.clone());
        self.wpe = Embedding::new(var.as_tensor().clone(), self.config.n_embd);
        self.config.block_size = block_size;
        Ok(())
    }
}

impl LanguageModel for Gpt {
    fn loss(&self, input: &Tensor, targets: &Tensor, ctx: ForwardContext) -> Result<Tensor> {
        let plan = ForwardPlan::new(input.dim(1)?, &self.device)?;
        self.loss_with_plan(input, targets, ctx, &plan)
    }

    fn config(&self) -> &GptConfig {
        &self.config
    }

    fn num_params(&self, non_embedding: bool) -> usize {
        let blocks: usize = self.blocks.iter().map(Block::num_params).sum();
        let total = self.wte.embeddings().elem_count()
            + self.wpe.embeddings().elem_count()
            + blocks
            + self.ln_f.num_params();
        if non_embedding {
            total - self.wpe.embeddings().elem_count()
        } else {
            total
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
