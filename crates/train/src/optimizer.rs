//! AdamW with exportable state, and the gradient buffer it consumes.
//!
//! candle's own `AdamW` keeps its moments private, so checkpoints could not
//! restore them. This one stores first/second moments per named parameter and
//! applies weight decay only to matrices (rank ≥ 2); biases, norms and the
//! position table are left undecayed.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail};
use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;
use tracing::info;

use forge_core::to_raw_name;

// ── Parameters ──────────────────────────────────────────────────────────────

/// A trainable tensor with its raw (unwrapped) name.
#[derive(Clone)]
pub struct NamedParam {
    pub name: String,
    pub var: Var,
    /// Whether weight decay applies.
    pub decay: bool,
}

/// All vars in `varmap`, sorted by raw name.
pub fn named_params(varmap: &VarMap) -> anyhow::Result<Vec<NamedParam>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("varmap lock poisoned"))?;
    let mut params: Vec<NamedParam> = data
        .iter()
        .map(|(name, var)| NamedParam {
            name: to_raw_name(name).to_string(),
            var: var.clone(),
            decay: var.rank() >= 2,
        })
        .collect();
    params.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(params)
}

// ── Gradients ───────────────────────────────────────────────────────────────

/// Accumulated gradients aligned with a parameter list.
pub struct Gradients {
    grads: Vec<Option<Tensor>>,
}

impl Gradients {
    pub fn new(num_params: usize) -> Self {
        Self {
            grads: vec![None; num_params],
        }
    }

    /// Add the gradients of one backward pass.
    pub fn accumulate(&mut self, params: &[NamedParam], store: &GradStore) -> Result<()> {
        for (slot, param) in self.grads.iter_mut().zip(params) {
            if let Some(g) = store.get(param.var.as_tensor()) {
                let g = g.detach();
                *slot = Some(match slot.take() {
                    Some(acc) => (acc + g)?,
                    None => g,
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&Tensor> {
        self.grads.get(index).and_then(|g| g.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.grads.iter().all(Option::is_none)
    }

    /// Global L2 norm over every gradient.
    pub fn global_norm(&self) -> Result<f64> {
        let mut total = 0.0f64;
        for g in self.grads.iter().flatten() {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
        Ok(total.sqrt())
    }

    /// Multiply every gradient by `factor`.
    pub fn scale(&mut self, factor: f64) -> Result<()> {
        for slot in self.grads.iter_mut() {
            if let Some(g) = slot.take() {
                *slot = Some(g.affine(factor, 0.0)?);
            }
        }
        Ok(())
    }

    /// Rescale so the global norm does not exceed `max_norm`. Returns the norm
    /// measured before clipping.
    pub fn clip(&mut self, max_norm: f64) -> Result<f64> {
        let norm = self.global_norm()?;
        if norm > max_norm {
            self.scale(max_norm / (norm + 1e-6))?;
        }
        Ok(norm)
    }

    /// False if any gradient holds an inf or NaN.
    pub fn all_finite(&self) -> Result<bool> {
        for g in self.grads.iter().flatten() {
            let s = g.abs()?.sum_all()?.to_scalar::<f32>()?;
            if !s.is_finite() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Concatenate all gradients into one host buffer; missing ones are zeros.
    pub fn flatten(&self, params: &[NamedParam]) -> Result<Vec<f32>> {
        let total: usize = params.iter().map(|p| p.var.elem_count()).sum();
        let mut flat = Vec::with_capacity(total);
        for (slot, param) in self.grads.iter().zip(params) {
            match slot {
                Some(g) => flat.extend(g.flatten_all()?.to_vec1::<f32>()?),
                None => flat.extend(std::iter::repeat(0.0).take(param.var.elem_count())),
            }
        }
        Ok(flat)
    }

    /// Inverse of [`flatten`](Self::flatten).
    pub fn assign_flat(&mut self, params: &[NamedParam], flat: &[f32]) -> Result<()> {
        let mut offset = 0;
        for (slot, param) in self.grads.iter_mut().zip(params) {
            let n = param.var.elem_count();
            let chunk = flat.get(offset..offset + n).ok_or_else(|| {
                candle_core::Error::Msg(format!("flat gradient buffer too short for {}", param.name))
            })?;
            *slot = Some(Tensor::from_slice(chunk, param.var.dims(), param.var.device())?);
            offset += n;
        }
        Ok(())
    }

    /// Release every gradient.
    pub fn clear(&mut self) {
        for slot in self.grads.iter_mut() {
            *slot = None;
        }
    }
}

// ── AdamW ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct AdamWParams {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWParams {
    fn default() -> Self {
        Self {
            lr: 6e-4,
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
            weight_decay: 0.1,
        }
    }
}

/// Exportable optimizer state, keyed by raw parameter name.
#[derive(Clone)]
pub struct OptimizerState {
    pub step: usize,
    pub exp_avg: BTreeMap<String, Tensor>,
    pub exp_avg_sq: BTreeMap<String, Tensor>,
}

pub struct AdamW {
    params: Vec<NamedParam>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    step_t: usize,
    hp: AdamWParams,
}

impl AdamW {
    pub fn new(params: Vec<NamedParam>, hp: AdamWParams) -> Result<Self> {
        let exp_avg = params
            .iter()
            .map(|p| p.var.zeros_like())
            .collect::<Result<Vec<_>>>()?;
        let exp_avg_sq = params
            .iter()
            .map(|p| p.var.zeros_like())
            .collect::<Result<Vec<_>>>()?;

        let decayed: usize = params.iter().filter(|p| p.decay).map(|p| p.var.elem_count()).sum();
        let plain: usize = params.iter().filter(|p| !p.decay).map(|p| p.var.elem_count()).sum();
        info!(
            "num decayed parameter tensors: {}, with {decayed} parameters",
            params.iter().filter(|p| p.decay).count()
        );
        info!(
            "num non-decayed parameter tensors: {}, with {plain} parameters",
            params.iter().filter(|p| !p.decay).count()
        );

        Ok(Self {
            params,
            exp_avg,
            exp_avg_sq,
            step_t: 0,
            hp,
        })
    }

    pub fn params(&self) -> &[NamedParam] {
        &self.params
    }

    pub fn learning_rate(&self) -> f64 {
        self.hp.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.hp.lr = lr;
    }

    /// Optimizer steps taken so far.
    pub fn step_count(&self) -> usize {
        self.step_t
    }

    /// One update from `grads`. Parameters without a gradient are untouched.
    pub fn step(&mut self, grads: &Gradients) -> Result<()> {
        self.step_t += 1;
        let AdamWParams {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.hp;
        let t = self.step_t as i32;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);

        for (i, param) in self.params.iter().enumerate() {
            let Some(g) = grads.get(i) else { continue };
            let m = (self.exp_avg[i].affine(beta1, 0.0)? + g.affine(1.0 - beta1, 0.0)?)?;
            let v = (self.exp_avg_sq[i].affine(beta2, 0.0)? + g.sqr()?.affine(1.0 - beta2, 0.0)?)?;

            let m_hat = m.affine(1.0 / bias_correction1, 0.0)?;
            let denom = v.affine(1.0 / bias_correction2, 0.0)?.sqrt()?.affine(1.0, eps)?;
            let update = (m_hat / denom)?.affine(lr, 0.0)?;

            let theta = param.var.as_detached_tensor();
            let theta = if param.decay {
                theta.affine(1.0 - lr * weight_decay, 0.0)?
            } else {
                theta
            };
            param.var.set(&(theta - update)?)?;

            self.exp_avg[i] = m;
            self.exp_avg_sq[i] = v;
        }
        Ok(())
    }

    pub fn state(&self) -> OptimizerState {
        let named = |moments: &[Tensor]| -> BTreeMap<String, Tensor> {
            self.params
                .iter()
                .zip(moments)
                .map(|(p, t)| (p.name.clone(), t.clone()))
                .collect()
        };
        OptimizerState {
            step: self.step_t,
            exp_avg: named(&self.exp_avg),
            exp_avg_sq: named(&self.exp_avg_sq),
        }
    }

    /// Restore moments saved by [`state`](Self::state). Every parameter must be
    /// present with a matching shape.
    pub fn load_state(&mut self, state: &OptimizerState) -> anyhow::Result<()> {
        for (i, param) in self.params.iter().enumerate() {
            for (store, target) in [(&state.exp_avg, &mut self.exp_avg[i]), (&state.exp_avg_sq, &mut self.exp_avg_sq[i])] {
                let saved = store
                    .get(&param.name)
                    .ok_or_else(|| anyhow!("optimizer state has no entry for {}", param.name))?;
                if saved.dims() != param.var.dims() {
                    bail!(
                        "optimizer state for {} has shape {:?}, parameter is {:?}",
                        param.name,
                        saved.dims(),
                        param.var.dims()
                    );
                }
                *target = saved.to_device(param.var.device())?.to_dtype(param.var.dtype())?;
            }
        }
        self.step_t = state.step;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn param(name: &str, values: &[f32], shape: &[usize]) -> NamedParam {
        let t = Tensor::from_slice(values, shape, &Device::Cpu).unwrap();
        let var = Var::from_tensor(&t).unwrap();
        NamedParam {
            name: name.into(),
            decay: var.rank() >= 2,
            var,
        }
    }

    fn grads_of(params: &[NamedParam], values: &[&[f32]]) -> Gradients {
        let mut g = Gradients::new(params.len());
        let flat: Vec<f32> = values.iter().flat_map(|v| v.iter().copied()).collect();
        g.assign_flat(params, &flat).unwrap();
        g
    }

    #[test]
    fn named_params_strip_compiled_prefix_and_sort() {
        let varmap = VarMap::new();
        {
            let mut data = varmap.data().lock().unwrap();
            data.insert(
                "_orig_mod.b.weight".into(),
                Var::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
            );
            data.insert("a.bias".into(), Var::zeros(2, DType::F32, &Device::Cpu).unwrap());
        }
        let params = named_params(&varmap).unwrap();
        let names: Vec<_> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a.bias", "b.weight"]);
        assert!(!params[0].decay);
        assert!(params[1].decay);
    }

    #[test]
    fn clip_scales_to_max_norm() {
        let params = vec![param("w", &[0.0, 0.0], &[2])];
        let mut g = grads_of(&params, &[&[3.0, 4.0]]);
        let before = g.clip(1.0).unwrap();
        assert!((before - 5.0).abs() < 1e-6);
        assert!((g.global_norm().unwrap() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn clip_below_threshold_is_noop() {
        let params = vec![param("w", &[0.0, 0.0], &[2])];
        let mut g = grads_of(&params, &[&[0.3, 0.4]]);
        g.clip(1.0).unwrap();
        assert_eq!(g.get(0).unwrap().to_vec1::<f32>().unwrap(), vec![0.3, 0.4]);
    }

    #[test]
    fn non_finite_gradients_are_detected() {
        let params = vec![param("w", &[0.0, 0.0], &[2])];
        assert!(grads_of(&params, &[&[1.0, 2.0]]).all_finite().unwrap());
        assert!(!grads_of(&params, &[&[f32::INFINITY, 2.0]]).all_finite().unwrap());
        assert!(!grads_of(&params, &[&[f32::NAN, 2.0]]).all_finite().unwrap());
    }

    #[test]
    fn flatten_pads_missing_gradients() {
        let params = vec![param("a", &[0.0; 2], &[2]), param("b", &[0.0; 3], &[3])];
        let mut g = Gradients::new(2);
        assert!(g.is_empty());
        g.assign_flat(&params[..1], &[1.0, 2.0]).unwrap();
        assert_eq!(g.flatten(&params).unwrap(), vec![1.0, 2.0, 0.0, 0.0, 0.0]);
        g.clear();
        assert!(g.is_empty());
    }

    #[test]
    fn first_step_moves_each_weight_by_lr() {
        // With bias correction the first Adam update is lr * sign(g).
        let params = vec![param("w", &[1.0, 1.0], &[2])];
        let hp = AdamWParams {
            lr: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut opt = AdamW::new(params.clone(), hp).unwrap();
        opt.step(&grads_of(&params, &[&[0.5, -2.0]])).unwrap();
        let w = params[0].var.as_tensor().to_vec1::<f32>().unwrap();
        assert!((w[0] - 0.9).abs() < 1e-5);
        assert!((w[1] - 1.1).abs() < 1e-5);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn weight_decay_skips_vectors() {
        let params = vec![param("m", &[1.0; 4], &[2, 2]), param("b", &[1.0; 2], &[2])];
        let hp = AdamWParams {
            lr: 0.1,
            weight_decay: 0.5,
            ..Default::default()
        };
        let mut opt = AdamW::new(params.clone(), hp).unwrap();
        // Zero gradients: only decay moves the weights.
        opt.step(&grads_of(&params, &[&[0.0; 4], &[0.0; 2]])).unwrap();
        let m = params[0].var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = params[1].var.as_tensor().to_vec1::<f32>().unwrap();
        assert!((m[0] - 0.95).abs() < 1e-6);
        assert_eq!(b, vec![1.0, 1.0]);
    }

    #[test]
    fn state_round_trips_into_fresh_optimizer() {
        let params = vec![param("w", &[1.0, 1.0], &[2])];
        let mut opt = AdamW::new(params.clone(), AdamWParams::default()).unwrap();
        opt.step(&grads_of(&params, &[&[0.5, -2.0]])).unwrap();
        let state = opt.state();

        let mut fresh = AdamW::new(params.clone(), AdamWParams::default()).unwrap();
        fresh.load_state(&state).unwrap();
        assert_eq!(fresh.step_count(), 1);
        let a = fresh.state().exp_avg["w"].to_vec1::<f32>().unwrap();
        let b = state.exp_avg["w"].to_vec1::<f32>().unwrap();
        assert_eq!(a, b);

        let mut wrong = state.clone();
        wrong.exp_avg.insert("w".into(), Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap());
        assert!(fresh.load_state(&wrong).is_err());
    }
}
