//! Model construction for the three start modes.
//!
//! * `scratch`: architecture from the config, vocabulary from the corpus'
//!   `meta.json` (else the padded GPT-2 size).
//! * `resume`: architecture and weights from `out_dir/ckpt.safetensors`;
//!   only non-shape fields such as dropout come from the current config.
//! * `pretrained:<name>`: GPT-2 layout weights from `pretrained_dir`.
//!
//! Afterwards the position table may be cropped to the configured block size
//! and the model wrapped in the compiled view.

use std::collections::BTreeMap;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::info;

use forge_common::{GptConfig, TokenCorpus, FALLBACK_VOCAB_SIZE};
use forge_core::model::WPE_NAME;
use forge_core::{load_pretrained, Gpt, LanguageModel, TrainableModel};

use crate::checkpoint::{self, checkpoint_path, INITIAL_BEST_VAL_LOSS};
use crate::config::{InitFrom, TrainConfig};
use crate::error::TrainError;
use crate::optimizer::OptimizerState;
use crate::precision::ScalerState;

/// The model and the counters that travel with it.
pub struct ModelState {
    pub model: TrainableModel,
    pub varmap: VarMap,
    pub model_args: GptConfig,
    /// Completed optimizer steps.
    pub iter_num: usize,
    pub best_val_loss: f64,
}

/// Optimizer-side state recovered from a checkpoint.
pub struct ResumeState {
    pub optimizer: OptimizerState,
    pub grad_scaler: Option<ScalerState>,
}

pub struct BuiltModel {
    pub state: ModelState,
    pub resume: Option<ResumeState>,
}

pub fn build(config: &TrainConfig, device: &Device) -> anyhow::Result<BuiltModel> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

    let (mut gpt, iter_num, best_val_loss, mut resume) = match &config.init_from {
        InitFrom::Scratch => {
            info!("initializing a new model from scratch");
            let corpus = TokenCorpus::new(config.data_dir());
            let vocab_size = match corpus.vocab_size()? {
                Some(v) => {
                    info!("found vocab_size = {v} (inside {})", corpus.dir().display());
                    v
                }
                None => {
                    info!("defaulting to vocab_size of GPT-2 to {FALLBACK_VOCAB_SIZE} (50257 rounded up for efficiency)");
                    FALLBACK_VOCAB_SIZE
                }
            };
            let gpt = Gpt::new(vb, &config.model_args(vocab_size))?;
            (gpt, 0, INITIAL_BEST_VAL_LOSS, None)
        }
        InitFrom::Resume => {
            info!("resuming training from {}", config.out_dir.display());
            let ckpt = checkpoint::load(&checkpoint_path(&config.out_dir))?;
            let requested = config.model_args(ckpt.meta.model_args.vocab_size);
            let overridden = requested.architecture_diff(&ckpt.meta.model_args);
            if !overridden.is_empty() {
                info!("checkpoint architecture overrides config: {}", overridden.join(", "));
            }
            let args = requested.with_architecture_of(&ckpt.meta.model_args);
            let gpt = Gpt::new(vb, &args)?;
            load_weights(&varmap, &ckpt.model)?;
            let resume = ResumeState {
                optimizer: ckpt.optimizer,
                grad_scaler: ckpt.meta.grad_scaler,
            };
            (gpt, ckpt.meta.iter_num, ckpt.meta.best_val_loss, Some(resume))
        }
        InitFrom::Pretrained(name) => {
            info!("initializing from pretrained weights: {name}");
            let gpt = load_pretrained(&config.pretrained_dir, name, config.dropout, &varmap, device)
                .with_context(|| format!("loading pretrained model {name}"))?;
            (gpt, 0, INITIAL_BEST_VAL_LOSS, None)
        }
    };

    if config.block_size < gpt.config().block_size {
        info!(
            "cropping block size {} -> {}",
            gpt.config().block_size,
            config.block_size
        );
        gpt.crop_block_size(&varmap, config.block_size)?;
        if let Some(resume) = resume.as_mut() {
            crop_moment_rows(&mut resume.optimizer, WPE_NAME, config.block_size)?;
        }
    }
    let model_args = gpt.config().clone();
    info!(
        "number of parameters: {:.2}M",
        gpt.num_params(true) as f64 / 1e6
    );

    let mut model = TrainableModel::Eager(gpt);
    if config.compile {
        info!("compiling the model");
        model = model.compile();
    }

    Ok(BuiltModel {
        state: ModelState {
            model,
            varmap,
            model_args,
            iter_num,
            best_val_loss,
        },
        resume,
    })
}

/// Keep the first `rows` rows of `name`'s AdamW moments, matching a cropped
/// parameter.
fn crop_moment_rows(state: &mut OptimizerState, name: &str, rows: usize) -> candle_core::Result<()> {
    for moments in [&mut state.exp_avg, &mut state.exp_avg_sq] {
        if let Some(t) = moments.get_mut(name) {
            if t.dim(0)? > rows {
                *t = t.narrow(0, 0, rows)?.contiguous()?;
            }
        }
    }
    Ok(())
}

/// Copy checkpoint tensors into the model's vars. The two name sets must be
/// identical and every shape must agree.
pub fn load_weights(varmap: &VarMap, saved: &BTreeMap<String, Tensor>) -> anyhow::Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("varmap lock poisoned"))?;
    if let Some(extra) = saved.keys().find(|k| !data.contains_key(k.as_str())) {
        return Err(TrainError::ArchitectureMismatch(format!("unexpected parameter {extra}")).into());
    }
    for (name, var) in data.iter() {
        let tensor = saved
            .get(name)
            .ok_or_else(|| TrainError::ArchitectureMismatch(format!("missing parameter {name}")))?;
        if tensor.dims() != var.dims() {
            return Err(TrainError::ArchitectureMismatch(format!(
                "{name}: checkpoint {:?}, model {:?}",
                tensor.dims(),
                var.dims()
            ))
            .into());
        }
        var.set(&tensor.to_device(var.device())?.to_dtype(var.dtype())?)?;
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
