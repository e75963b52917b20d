//! Checkpoint persistence.
//!
//! One file, `ckpt.safetensors`, holds everything needed to resume:
//!
//! * `model.<name>`: parameters by raw name
//! * `optimizer.exp_avg.<name>` / `optimizer.exp_avg_sq.<name>`: AdamW moments
//! * `__meta__`: a `u8` tensor with the JSON [`CheckpointMeta`]
//!
//! Writes go to `ckpt.safetensors.tmp`, are fsynced, then renamed over the
//! previous checkpoint, so a reader sees either the old file or the new one.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use forge_common::GptConfig;
use forge_core::compiled::raw_state;
use forge_core::to_raw_name;

use crate::error::TrainError;
use crate::optimizer::{AdamW, OptimizerState};
use crate::precision::{GradScaler, ScalerState};

pub const CHECKPOINT_FILE: &str = "ckpt.safetensors";
pub const FORMAT_VERSION: u32 = 1;

const META_KEY: &str = "__meta__";
const MODEL_PREFIX: &str = "model.";
const EXP_AVG_PREFIX: &str = "optimizer.exp_avg.";
const EXP_AVG_SQ_PREFIX: &str = "optimizer.exp_avg_sq.";

/// Best-loss sentinel before any evaluation (JSON cannot hold infinity).
pub const INITIAL_BEST_VAL_LOSS: f64 = 1e9;

/// Scalar state stored next to the tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub format_version: u32,
    pub model_args: GptConfig,
    pub iter_num: usize,
    pub best_val_loss: f64,
    /// Resolved run configuration, for provenance only.
    pub config: serde_json::Value,
    pub optimizer_step: usize,
    pub grad_scaler: Option<ScalerState>,
}

pub struct Checkpoint {
    pub model: BTreeMap<String, Tensor>,
    pub optimizer: OptimizerState,
    pub meta: CheckpointMeta,
}

impl Checkpoint {
    /// Snapshot the live training state.
    pub fn capture(
        varmap: &VarMap,
        optimizer: &AdamW,
        scaler: &GradScaler,
        model_args: &GptConfig,
        iter_num: usize,
        best_val_loss: f64,
        config: serde_json::Value,
    ) -> anyhow::Result<Self> {
        let optimizer = optimizer.state();
        Ok(Self {
            model: raw_state(varmap)?,
            meta: CheckpointMeta {
                format_version: FORMAT_VERSION,
                model_args: model_args.clone(),
                iter_num,
                best_val_loss,
                config,
                optimizer_step: optimizer.step,
                grad_scaler: scaler.state(),
            },
            optimizer,
        })
    }
}

pub fn checkpoint_path(dir: &Path) -> PathBuf {
    dir.join(CHECKPOINT_FILE)
}

// ── Save decision ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaveDecision {
    /// `min(best, val_loss)`.
    pub best_val_loss: f64,
    pub improved: bool,
    pub write: bool,
}

/// Whether the evaluation at `iter_num` should produce a checkpoint.
/// Nothing is written at iteration 0.
pub fn save_decision(iter_num: usize, val_loss: f64, best_val_loss: f64, always_save: bool) -> SaveDecision {
    let improved = val_loss < best_val_loss;
    SaveDecision {
        best_val_loss: if improved { val_loss } else { best_val_loss },
        improved,
        write: (improved || always_save) && iter_num > 0,
    }
}

// ── Manager ─────────────────────────────────────────────────────────────────

/// Reads and writes the checkpoint in `out_dir`. Only the master writes.
pub struct CheckpointManager {
    dir: PathBuf,
    is_master: bool,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, is_master: bool) -> Self {
        Self {
            dir: dir.into(),
            is_master,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        checkpoint_path(&self.dir)
    }

    /// Write atomically. Returns the path, or `None` on non-master ranks.
    pub fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<Option<PathBuf>> {
        if !self.is_master {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for (name, t) in &checkpoint.model {
            tensors.insert(format!("{MODEL_PREFIX}{name}"), t.clone());
        }
        for (name, t) in &checkpoint.optimizer.exp_avg {
            tensors.insert(format!("{EXP_AVG_PREFIX}{name}"), t.clone());
        }
        for (name, t) in &checkpoint.optimizer.exp_avg_sq {
            tensors.insert(format!("{EXP_AVG_SQ_PREFIX}{name}"), t.clone());
        }
        let meta = serde_json::to_vec(&checkpoint.meta)?;
        let len = meta.len();
        tensors.insert(META_KEY.to_string(), Tensor::from_vec(meta, len, &Device::Cpu)?);

        let path = self.path();
        let tmp = self.dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        candle_core::safetensors::save(&tensors, &tmp)
            .with_context(|| format!("writing {}", tmp.display()))?;
        File::open(&tmp)
            .and_then(|f| f.sync_all())
            .with_context(|| format!("syncing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("publishing {}", path.display()))?;
        sync_dir(&self.dir)?;

        debug!("wrote {}", path.display());
        Ok(Some(path))
    }

    pub fn load(&self) -> Result<Checkpoint, TrainError> {
        load(&self.path())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> anyhow::Result<()> {
    File::open(dir)
        .and_then(|f| f.sync_all())
        .with_context(|| format!("syncing {}", dir.display()))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> anyhow::Result<()> {
    Ok(())
}

// ── Loading ─────────────────────────────────────────────────────────────────

fn corrupt(path: &Path, reason: impl ToString) -> TrainError {
    TrainError::CheckpointCorrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn read_tensors(path: &Path) -> Result<HashMap<String, Tensor>, TrainError> {
    if !path.exists() {
        return Err(TrainError::CheckpointMissing(path.to_path_buf()));
    }
    candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| corrupt(path, e))
}

fn parse_meta(path: &Path, tensors: &HashMap<String, Tensor>) -> Result<CheckpointMeta, TrainError> {
    let raw = tensors
        .get(META_KEY)
        .ok_or_else(|| corrupt(path, "no __meta__ entry"))?;
    decode_meta(path, raw)
}

fn decode_meta(path: &Path, raw: &Tensor) -> Result<CheckpointMeta, TrainError> {
    if raw.dtype() != DType::U8 {
        return Err(corrupt(path, "__meta__ is not a byte tensor"));
    }
    let bytes = raw.to_vec1::<u8>().map_err(|e| corrupt(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| corrupt(path, e))
}

/// Read only the metadata of the checkpoint at `path`.
/// Only the `__meta__` entry is decoded; the parameters stay on disk.
pub fn read_meta(path: &Path) -> Result<CheckpointMeta, TrainError> {
    if !path.exists() {
        return Err(TrainError::CheckpointMissing(path.to_path_buf()));
    }
    // SAFETY: the file is only read, and checkpoints are replaced by rename,
    // never rewritten in place.
    let mapped = unsafe { MmapedSafetensors::new(path) }.map_err(|e| corrupt(path, e))?;
    let raw = mapped
        .load(META_KEY, &Device::Cpu)
        .map_err(|_| corrupt(path, "no __meta__ entry"))?;
    decode_meta(path, &raw)
}

/// Read a full checkpoint. Parameter names with a legacy `_orig_mod.`
/// prefix are mapped back to raw names. Tensors are loaded on the CPU.
pub fn load(path: &Path) -> Result<Checkpoint, TrainError> {
    let tensors = read_tensors(path)?;
    let meta = parse_meta(path, &tensors)?;
    if meta.format_version != FORMAT_VERSION {
        return Err(corrupt(
            path,
            format!("format version {} (expected {FORMAT_VERSION})", meta.format_version),
        ));
    }

    let mut model = BTreeMap::new();
    let mut exp_avg = BTreeMap::new();
    let mut exp_avg_sq = BTreeMap::new();
    for (key, tensor) in tensors {
        if let Some(name) = key.strip_prefix(MODEL_PREFIX) {
            model.insert(to_raw_name(name).to_string(), tensor);
        } else if let Some(name) = key.strip_prefix(EXP_AVG_PREFIX) {
            exp_avg.insert(to_raw_name(name).to_string(), tensor);
        } else if let Some(name) = key.strip_prefix(EXP_AVG_SQ_PREFIX) {
            exp_avg_sq.insert(to_raw_name(name).to_string(), tensor);
        }
    }
    if model.is_empty() {
        return Err(corrupt(path, "no model parameters"));
    }

    Ok(Checkpoint {
        model,
        optimizer: OptimizerState {
            step: meta.optimizer_step,
            exp_avg,
            exp_avg_sq,
        },
        meta,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap()
    }

    fn sample(iter_num: usize, best: f64) -> Checkpoint {
        let mut model = BTreeMap::new();
        model.insert("transformer.wte.weight".to_string(), tensor(&[1.0, 2.0]));
        let mut exp_avg = BTreeMap::new();
        exp_avg.insert("transformer.wte.weight".to_string(), tensor(&[0.1, 0.2]));
        let mut exp_avg_sq = BTreeMap::new();
        exp_avg_sq.insert("transformer.wte.weight".to_string(), tensor(&[0.01, 0.02]));
        Checkpoint {
            model,
            optimizer: OptimizerState {
                step: iter_num,
                exp_avg,
                exp_avg_sq,
            },
            meta: CheckpointMeta {
                format_version: FORMAT_VERSION,
                model_args: GptConfig::default(),
                iter_num,
                best_val_loss: best,
                config: serde_json::json!({"dataset": "shakespeare_char"}),
                optimizer_step: iter_num,
                grad_scaler: Some(ScalerState {
                    scale: 1024.0,
                    growth_tracker: 3,
                }),
            },
        }
    }

    #[test]
    fn round_trip_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), true);
        let path = manager.save(&sample(5000, 1.23)).unwrap().unwrap();
        assert!(path.ends_with(CHECKPOINT_FILE));
        assert!(!dir.path().join("ckpt.safetensors.tmp").exists());

        let ckpt = manager.load().unwrap();
        assert_eq!(ckpt.meta.iter_num, 5000);
        assert_eq!(ckpt.meta.best_val_loss, 1.23);
        assert_eq!(ckpt.meta.config["dataset"], "shakespeare_char");
        assert_eq!(ckpt.optimizer.step, 5000);
        assert_eq!(ckpt.meta.grad_scaler.unwrap().scale, 1024.0);
        assert_eq!(
            ckpt.model["transformer.wte.weight"].to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0]
        );
        assert_eq!(
            ckpt.optimizer.exp_avg_sq["transformer.wte.weight"].to_vec1::<f32>().unwrap(),
            vec![0.01, 0.02]
        );
        assert_eq!(read_meta(&path).unwrap(), ckpt.meta);
    }

    #[test]
    fn save_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), true);
        manager.save(&sample(2000, 2.5)).unwrap();
        manager.save(&sample(4000, 2.4)).unwrap();
        assert_eq!(manager.load().unwrap().meta.iter_num, 4000);
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn legacy_prefixed_names_are_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = sample(10, 3.0);
        let t = ckpt.model.remove("transformer.wte.weight").unwrap();
        ckpt.model.insert("_orig_mod.transformer.wte.weight".into(), t);
        let manager = CheckpointManager::new(dir.path(), true);
        manager.save(&ckpt).unwrap();
        let loaded = manager.load().unwrap();
        assert!(loaded.model.contains_key("transformer.wte.weight"));
    }

    #[test]
    fn non_master_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("out"), false);
        assert!(manager.save(&sample(2000, 2.0)).unwrap().is_none());
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn missing_and_corrupt_files_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), true);
        assert!(matches!(manager.load(), Err(TrainError::CheckpointMissing(_))));

        std::fs::write(manager.path(), b"definitely not safetensors").unwrap();
        assert!(matches!(manager.load(), Err(TrainError::CheckpointCorrupt { .. })));
    }

    #[test]
    fn read_meta_needs_only_the_meta_entry() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_meta(&checkpoint_path(dir.path())),
            Err(TrainError::CheckpointMissing(_))
        ));

        // A file with parameters but no metadata is rejected by name.
        let path = dir.path().join("bare.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("model.w".to_string(), tensor(&[1.0]));
        candle_core::safetensors::save(&tensors, &path).unwrap();
        match read_meta(&path) {
            Err(TrainError::CheckpointCorrupt { reason, .. }) => assert!(reason.contains("__meta__")),
            _ => panic!("expected a corrupt checkpoint"),
        }

        let manager = CheckpointManager::new(dir.path(), true);
        let path = manager.save(&sample(7, 0.5)).unwrap().unwrap();
        let meta = read_meta(&path).unwrap();
        assert_eq!(meta.iter_num, 7);
        assert_eq!(meta.format_version, FORMAT_VERSION);
    }

    #[test]
    fn no_save_at_iteration_zero() {
        let d = save_decision(0, 2.5, INITIAL_BEST_VAL_LOSS, false);
        assert!(d.improved);
        assert!(!d.write);
        assert_eq!(d.best_val_loss, 2.5);

        let d = save_decision(2000, 2.4, d.best_val_loss, false);
        assert!(d.write);
        assert_eq!(d.best_val_loss, 2.4);
    }

    #[test]
    fn always_save_keeps_best_as_minimum() {
        let d = save_decision(4000, 2.6, 2.4, true);
        assert!(!d.improved);
        assert!(d.write);
        assert_eq!(d.best_val_loss, 2.4);

        let d = save_decision(4000, 2.6, 2.4, false);
        assert!(!d.write);
    }
}
