//! Loss estimates over the train and validation splits.

use std::collections::BTreeMap;

use candle_core::{DType, Device};

use forge_common::{BatchSampler, Split, TokenCorpus};
use forge_core::{ForwardContext, LanguageModel};

/// Offsets the evaluation sampler's seed so it never shares a stream with
/// the training sampler.
const EVAL_SEED_OFFSET: u64 = 0x9E37_79B9_7F4A_7C15;

pub struct Evaluator {
    sampler: BatchSampler,
    eval_iters: usize,
    dtype: DType,
    device: Device,
}

impl Evaluator {
    pub fn new(
        corpus: TokenCorpus,
        batch_size: usize,
        block_size: usize,
        seed: u64,
        eval_iters: usize,
        dtype: DType,
        device: Device,
    ) -> Self {
        Self {
            sampler: BatchSampler::new(corpus, batch_size, block_size, seed.wrapping_add(EVAL_SEED_OFFSET)),
            eval_iters,
            dtype,
            device,
        }
    }

    /// Mean loss over `eval_iters` fresh batches per split, dropout off.
    pub fn evaluate(&mut self, model: &dyn LanguageModel, splits: &[Split]) -> anyhow::Result<BTreeMap<Split, f32>> {
        let ctx = ForwardContext::eval(self.dtype);
        let mut out = BTreeMap::new();
        for &split in splits {
            let mut total = 0.0f64;
            for _ in 0..self.eval_iters {
                let batch = self.sampler.sample(split)?.to_device(&self.device)?;
                let loss = model.loss(&batch.input, &batch.target, ctx)?.detach();
                total += loss.to_scalar::<f32>()? as f64;
            }
            out.insert(split, (total / self.eval_iters.max(1) as f64) as f32);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{VarBuilder, VarMap};
    use forge_common::{write_token_file, GptConfig};
    use forge_core::Gpt;

    fn setup(dropout: f64) -> (tempfile::TempDir, TokenCorpus, VarMap, Gpt) {
        let dir = tempfile::tempdir().unwrap();
        let tokens: Vec<u16> = (0..400).map(|i| ((i * 7) % 32) as u16).collect();
        write_token_file(&dir.path().join("train.bin"), &tokens).unwrap();
        write_token_file(&dir.path().join("val.bin"), &tokens[..200]).unwrap();
        let config = GptConfig {
            n_layer: 1,
            n_head: 2,
            n_embd: 16,
            block_size: 8,
            vocab_size: 32,
            dropout,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let gpt = Gpt::new(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu), &config).unwrap();
        let corpus = TokenCorpus::new(dir.path());
        (dir, corpus, varmap, gpt)
    }

    fn evaluator(corpus: TokenCorpus) -> Evaluator {
        Evaluator::new(corpus, 2, 8, 1337, 3, DType::F32, Device::Cpu)
    }

    #[test]
    fn reports_every_requested_split() {
        let (_dir, corpus, _varmap, gpt) = setup(0.0);
        let losses = evaluator(corpus).evaluate(&gpt, &Split::ALL).unwrap();
        assert_eq!(losses.len(), 2);
        for loss in losses.values() {
            assert!(loss.is_finite() && *loss > 0.0);
        }
    }

    #[test]
    fn eval_mode_is_deterministic_and_leaves_weights_alone() {
        let (_dir, corpus, varmap, gpt) = setup(0.5);
        let before: Vec<Vec<f32>> = varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();

        let a = evaluator(corpus.clone()).evaluate(&gpt, &[Split::Val]).unwrap();
        let b = evaluator(corpus).evaluate(&gpt, &[Split::Val]).unwrap();
        assert_eq!(a, b);

        let after: Vec<Vec<f32>> = varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn does_not_share_stream_with_training_sampler() {
        let (_dir, corpus, _varmap, _gpt) = setup(0.0);
        let mut train = BatchSampler::new(corpus.clone(), 2, 8, 1337);
        let mut eval = BatchSampler::new(corpus, 2, 8, 1337u64.wrapping_add(EVAL_SEED_OFFSET));
        let a = train.sample(Split::Train).unwrap();
        let b = eval.sample(Split::Train).unwrap();
        assert_ne!(a.offsets, b.offsets);
    }
}
