//! GPT-2 family weight import.
//!
//! Expects `<root>/<name>/model.safetensors` in the Hugging Face GPT-2 layout
//! and, optionally, `<root>/<name>/config.json`. Those checkpoints store the
//! projection weights as Conv1D `(in, out)` matrices, which are transposed
//! into the `(out, in)` linear layout on import.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::Deserialize;
use tracing::info;

use forge_common::GptConfig;

use crate::model::Gpt;

/// Weights stored as Conv1D in the GPT-2 checkpoints.
const CONV1D_SUFFIXES: [&str; 4] = [
    "attn.c_attn.weight",
    "attn.c_proj.weight",
    "mlp.c_fc.weight",
    "mlp.c_proj.weight",
];

/// Architecture of the published GPT-2 checkpoints.
pub fn gpt2_family(name: &str) -> Option<GptConfig> {
    let (n_layer, n_head, n_embd) = match name {
        "gpt2" => (12, 12, 768),
        "gpt2-medium" => (24, 16, 1024),
        "gpt2-large" => (36, 20, 1280),
        "gpt2-xl" => (48, 25, 1600),
        _ => return None,
    };
    Some(GptConfig {
        n_layer,
        n_head,
        n_embd,
        block_size: 1024,
        bias: true,
        vocab_size: 50257,
        dropout: 0.0,
    })
}

#[derive(Deserialize)]
struct HfGpt2Config {
    n_layer: usize,
    n_head: usize,
    n_embd: usize,
    #[serde(alias = "n_ctx")]
    n_positions: usize,
    vocab_size: usize,
}

fn architecture(name: &str, dir: &Path) -> anyhow::Result<GptConfig> {
    let config_path = dir.join("config.json");
    if config_path.exists() {
        let text = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let hf: HfGpt2Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", config_path.display()))?;
        return Ok(GptConfig {
            n_layer: hf.n_layer,
            n_head: hf.n_head,
            n_embd: hf.n_embd,
            block_size: hf.n_positions,
            bias: true,
            vocab_size: hf.vocab_size,
            dropout: 0.0,
        });
    }
    gpt2_family(name).ok_or_else(|| anyhow!("unknown pretrained model '{name}' and no config.json in {}", dir.display()))
}

/// Build a `Gpt` in `varmap` and fill it with the weights of `name`.
///
/// Only `dropout` may differ from the published architecture.
pub fn load_pretrained(
    root: &Path,
    name: &str,
    dropout: f64,
    varmap: &VarMap,
    device: &Device,
) -> anyhow::Result<Gpt> {
    let dir = root.join(name);
    let mut config = architecture(name, &dir)?;
    config.dropout = dropout;
    info!(
        "loading pretrained {name}: n_layer={} n_head={} n_embd={}",
        config.n_layer, config.n_head, config.n_embd
    );

    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    let model = Gpt::new(vb, &config)?;

    let weights_path = dir.join("model.safetensors");
    let tensors = candle_core::safetensors::load(&weights_path, device)
        .with_context(|| format!("reading {}", weights_path.display()))?;
    import_gpt2_tensors(varmap, tensors)?;
    Ok(model)
}

/// Copy GPT-2 layout tensors into matching vars. Every var must be covered.
pub fn import_gpt2_tensors(varmap: &VarMap, tensors: HashMap<String, Tensor>) -> anyhow::Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("varmap lock poisoned"))?;
    let mut loaded = 0usize;
    for (key, tensor) in tensors {
        let short = key.strip_prefix("transformer.").unwrap_or(key.as_str());
        // Causal-mask buffers and the tied head carry no trainable state.
        if short.starts_with("lm_head") || short.ends_with(".attn.bias") || short.ends_with(".attn.masked_bias") {
            continue;
        }
        let name = format!("transformer.{short}");
        let var = data
            .get(&name)
            .ok_or_else(|| anyhow!("pretrained tensor {key} has no counterpart"))?;
        let tensor = if CONV1D_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            tensor.t()?.contiguous()?
        } else {
            tensor
        };
        let tensor = tensor.to_dtype(DType::F32)?;
        if tensor.dims() != var.dims() {
            bail!(
                "shape mismatch for {name}: checkpoint {:?}, model {:?}",
                tensor.dims(),
                var.dims()
            );
        }
        var.set(&tensor)?;
        loaded += 1;
    }
    if loaded != data.len() {
        bail!("pretrained weights cover {loaded} of {} parameters", data.len());
    }
    Ok(loaded)
}
