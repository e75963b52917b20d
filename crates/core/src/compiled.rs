//! Eager and compiled views of the same model.
//!
//! Compiling wraps a [`Gpt`] in a view that caches one [`ForwardPlan`] per
//! sequence length and exposes parameters under `_orig_mod.<raw>`. The wrap is
//! reversible and shares all weights with the raw model. Serialisation always
//! goes through raw names.

use std::collections::{BTreeMap, HashMap};

use candle_core::{Result, Tensor};
use candle_nn::VarMap;
use parking_lot::Mutex;
use tracing::debug;

use forge_common::GptConfig;

use crate::model::{ForwardPlan, Gpt};
use crate::{ForwardContext, LanguageModel};

/// Prefix the compiled view puts in front of every parameter name.
pub const COMPILED_PREFIX: &str = "_orig_mod.";

/// Raw parameter name → compiled-view name.
pub fn to_trainable_name(raw: &str) -> String {
    format!("{COMPILED_PREFIX}{raw}")
}

/// Compiled-view (or already raw) name → raw name.
pub fn to_raw_name(name: &str) -> &str {
    name.strip_prefix(COMPILED_PREFIX).unwrap_or(name)
}

pub struct CompiledGpt {
    inner: Gpt,
    plans: Mutex<HashMap<usize, ForwardPlan>>,
}

impl CompiledGpt {
    pub fn new(inner: Gpt) -> Self {
        Self {
            inner,
            plans: Mutex::new(HashMap::new()),
        }
    }

    pub fn raw(&self) -> &Gpt {
        &self.inner
    }

    pub fn into_raw(self) -> Gpt {
        self.inner
    }

    /// Number of distinct sequence lengths seen so far.
    pub fn cached_plans(&self) -> usize {
        self.plans.lock().len()
    }

    fn plan(&self, seq_len: usize) -> Result<ForwardPlan> {
        let mut plans = self.plans.lock();
        if let Some(plan) = plans.get(&seq_len) {
            return Ok(plan.clone());
        }
        debug!("compiling forward plan for seq_len={seq_len}");
        let plan = ForwardPlan::new(seq_len, self.inner.device())?;
        plans.insert(seq_len, plan.clone());
        Ok(plan)
    }
}

impl LanguageModel for CompiledGpt {
    fn loss(&self, input: &Tensor, targets: &Tensor, ctx: ForwardContext) -> Result<Tensor> {
        let plan = self.plan(input.dim(1)?)?;
        self.inner.loss_with_plan(input, targets, ctx, &plan)
    }

    fn config(&self) -> &GptConfig {
        self.inner.config()
    }

    fn num_params(&self, non_embedding: bool) -> usize {
        self.inner.num_params(non_embedding)
    }
}

/// The model as the training loop sees it.
pub enum TrainableModel {
    Eager(Gpt),
    Compiled(CompiledGpt),
}

impl TrainableModel {
    pub fn compile(self) -> Self {
        match self {
            Self::Eager(gpt) => Self::Compiled(CompiledGpt::new(gpt)),
            compiled => compiled,
        }
    }

    pub fn decompile(self) -> Self {
        match self {
            Self::Compiled(c) => Self::Eager(c.into_raw()),
            eager => eager,
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self, Self::Compiled(_))
    }

    pub fn raw(&self) -> &Gpt {
        match self {
            Self::Eager(gpt) => gpt,
            Self::Compiled(c) => c.raw(),
        }
    }

    /// Name this view uses for the raw parameter `raw`.
    pub fn parameter_name(&self, raw: &str) -> String {
        if self.is_compiled() {
            to_trainable_name(raw)
        } else {
            raw.to_string()
        }
    }

    /// Parameters keyed the way this view names them.
    pub fn named_parameters(&self, varmap: &VarMap) -> Result<BTreeMap<String, Tensor>> {
        Ok(raw_state(varmap)?
            .into_iter()
            .map(|(raw, t)| (self.parameter_name(&raw), t))
            .collect())
    }
}

/// Parameters keyed by raw name, independent of any wrapping.
pub fn raw_state(varmap: &VarMap) -> Result<BTreeMap<String, Tensor>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".into()))?;
    Ok(data
        .iter()
        .map(|(name, var)| (to_raw_name(name).to_string(), var.as_tensor().clone()))
        .collect())
}

impl LanguageModel for TrainableModel {
    fn loss(&self, input: &Tensor, targets: &Tensor, ctx: ForwardContext) -> Result<Tensor> {
        match self {
            Self::Eager(gpt) => gpt.loss(input, targets, ctx),
            Self::Compiled(c) => c.loss(input, targets, ctx),
        }
    }

    fn config(&self) -> &GptConfig {
        self.raw().config()
    }

    fn num_params(&self, non_embedding: bool) -> usize {
        self.raw().num_params(non_embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    fn model() -> (VarMap, Gpt) {
        let varmap = VarMap::new();
        let config = GptConfig {
            n_layer: 1,
            n_head: 2,
            n_embd: 8,
            block_size: 8,
            vocab_size: 16,
            ..Default::default()
        };
        let gpt = Gpt::new(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu), &config).unwrap();
        (varmap, gpt)
    }

    #[test]
    fn name_mapping_round_trips() {
        let raw = "transformer.h.0.attn.c_attn.weight";
        let wrapped = to_trainable_name(raw);
        assert_eq!(wrapped, "_orig_mod.transformer.h.0.attn.c_attn.weight");
        assert_eq!(to_raw_name(&wrapped), raw);
        assert_eq!(to_raw_name(raw), raw);
    }

    #[test]
    fn compiled_view_matches_eager_and_caches_plans() {
        let (varmap, gpt) = model();
        let input = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 8]], &Device::Cpu).unwrap();
        let target = Tensor::new(&[[2u32, 3, 4, 5], [6, 7, 8, 9]], &Device::Cpu).unwrap();
        let ctx = ForwardContext::eval(DType::F32);

        let eager = TrainableModel::Eager(gpt);
        let a = eager.loss(&input, &target, ctx).unwrap().to_scalar::<f32>().unwrap();

        let compiled = eager.compile();
        assert!(compiled.is_compiled());
        let b = compiled.loss(&input, &target, ctx).unwrap().to_scalar::<f32>().unwrap();
        compiled.loss(&input, &target, ctx).unwrap();
        assert!((a - b).abs() < 1e-6);
        if let TrainableModel::Compiled(c) = &compiled {
            assert_eq!(c.cached_plans(), 1);
        }

        let names = compiled.named_parameters(&varmap).unwrap();
        assert!(names.keys().all(|k| k.starts_with(COMPILED_PREFIX)));
        assert!(!compiled.decompile().is_compiled());
        assert!(raw_state(&varmap)
            .unwrap()
            .keys()
            .all(|k| !k.starts_with(COMPILED_PREFIX)));
    }
}
