//! Model arguments for the GPT decoder.
//!
//! Serialised as JSON inside checkpoints so a resumed run rebuilds exactly the
//! architecture it trained. Missing fields fall back to the GPT-2 small values.

use serde::{Deserialize, Serialize};

/// Vocabulary size used when the corpus does not report one: GPT-2's 50257
/// rounded up to a multiple of 64.
pub const FALLBACK_VOCAB_SIZE: usize = 50304;

/// Architecture of the decoder-only transformer.
///
/// `n_layer`, `n_head`, `n_embd`, `block_size`, `bias` and `vocab_size` decide
/// parameter shapes and are frozen once a model exists. `dropout` is carried
/// along but may change between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptConfig {
    // ── Shape-defining ──────────────────────────────────────────────────────
    /// Number of decoder blocks.
    #[serde(default = "default_n_layer")]
    pub n_layer: usize,
    /// Attention heads per block.
    #[serde(default = "default_n_head")]
    pub n_head: usize,
    /// Model width.
    #[serde(default = "default_n_embd")]
    pub n_embd: usize,
    /// Maximum context length (rows of the position embedding).
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Bias terms in linear layers and layer norms.
    #[serde(default = "default_true")]
    pub bias: bool,
    /// Token vocabulary size.
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    // ── Regularisation ──────────────────────────────────────────────────────
    #[serde(default)]
    pub dropout: f64,
}

fn default_n_layer() -> usize {
    12
}
fn default_n_head() -> usize {
    12
}
fn default_n_embd() -> usize {
    768
}
fn default_block_size() -> usize {
    1024
}
fn default_true() -> bool {
    true
}
fn default_vocab_size() -> usize {
    FALLBACK_VOCAB_SIZE
}

impl Default for GptConfig {
    fn default() -> Self {
        Self {
            n_layer: 12,
            n_head: 12,
            n_embd: 768,
            block_size: 1024,
            bias: true,
            vocab_size: FALLBACK_VOCAB_SIZE,
            dropout: 0.0,
        }
    }
}

impl GptConfig {
    /// Per-head width. Errors if `n_embd` does not split evenly.
    pub fn head_dim(&self) -> anyhow::Result<usize> {
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            anyhow::bail!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd,
                self.n_head
            );
        }
        Ok(self.n_embd / self.n_head)
    }

    /// Copy every shape-defining field from `other`, keeping this config's dropout.
    pub fn with_architecture_of(&self, other: &GptConfig) -> GptConfig {
        GptConfig {
            n_layer: other.n_layer,
            n_head: other.n_head,
            n_embd: other.n_embd,
            block_size: other.block_size,
            bias: other.bias,
            vocab_size: other.vocab_size,
            dropout: self.dropout,
        }
    }

    /// Shape-defining fields that differ between `self` and `other`.
    pub fn architecture_diff(&self, other: &GptConfig) -> Vec<&'static str> {
        let mut diff = Vec::new();
        if self.n_layer != other.n_layer {
            diff.push("n_layer");
        }
        if self.n_head != other.n_head {
            diff.push("n_head");
        }
        if self.n_embd != other.n_embd {
            diff.push("n_embd");
        }
        if self.block_size != other.block_size {
            diff.push("block_size");
        }
        if self.bias != other.bias {
            diff.push("bias");
        }
        if self.vocab_size != other.vocab_size {
            diff.push("vocab_size");
        }
        diff
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
