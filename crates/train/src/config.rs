//! Resolved run configuration.
//!
//! A [`TrainConfig`] is built once: defaults, then a JSON override file, then
//! `key=value` overrides, then [`TrainConfig::validate`]. It is never mutated
//! afterwards; components receive it by reference.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use forge_common::GptConfig;

use crate::error::TrainError;

// ── Precision ───────────────────────────────────────────────────────────────

/// Numeric precision of the forward/backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Float32,
    Bfloat16,
    Float16,
}

impl Precision {
    /// Precision actually used on `device`. CPUs always compute in f32.
    pub fn effective(self, device: &Device) -> Precision {
        if device.is_cpu() {
            Precision::Float32
        } else {
            self
        }
    }

    /// Dtype activations are cast to on `device`.
    pub fn compute_dtype(self, device: &Device) -> DType {
        match self.effective(device) {
            Precision::Float32 => DType::F32,
            Precision::Bfloat16 => DType::BF16,
            Precision::Float16 => DType::F16,
        }
    }
}

// ── Device / backend ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl DeviceKind {
    /// Device for the process with the given local rank.
    pub fn resolve(self, local_rank: usize) -> anyhow::Result<Device> {
        let device = match self {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Auto => Device::cuda_if_available(local_rank)?,
            DeviceKind::Cuda => Device::new_cuda(local_rank).context("binding CUDA device")?,
            DeviceKind::Metal => Device::new_metal(local_rank).context("binding Metal device")?,
        };
        Ok(device)
    }
}

/// Collective transport between processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Tcp,
}

impl FromStr for Backend {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Backend::Tcp),
            other => Err(TrainError::UnsupportedBackend(other.to_string())),
        }
    }
}

// ── InitFrom ────────────────────────────────────────────────────────────────

/// Where the initial weights come from. Serialised as `scratch`, `resume` or
/// `pretrained:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum InitFrom {
    Scratch,
    Resume,
    Pretrained(String),
}

impl FromStr for InitFrom {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scratch" => Ok(InitFrom::Scratch),
            "resume" => Ok(InitFrom::Resume),
            other => match other.strip_prefix("pretrained:") {
                Some(name) if !name.is_empty() => Ok(InitFrom::Pretrained(name.to_string())),
                _ => Err(TrainError::Config(format!(
                    "init_from must be scratch, resume or pretrained:<name>, got '{other}'"
                ))),
            },
        }
    }
}

impl TryFrom<String> for InitFrom {
    type Error = TrainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<InitFrom> for String {
    fn from(init: InitFrom) -> Self {
        init.to_string()
    }
}

impl fmt::Display for InitFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitFrom::Scratch => write!(f, "scratch"),
            InitFrom::Resume => write!(f, "resume"),
            InitFrom::Pretrained(name) => write!(f, "pretrained:{name}"),
        }
    }
}

// ── TrainConfig ─────────────────────────────────────────────────────────────

/// Every knob of a training run. Defaults reproduce GPT-2 small on OpenWebText.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    // I/O
    pub out_dir: PathBuf,
    pub eval_interval: usize,
    pub log_interval: usize,
    pub eval_iters: usize,
    pub eval_only: bool,
    pub always_save_checkpoint: bool,
    pub init_from: InitFrom,
    pub metrics_log: bool,
    pub run_name: String,

    // Data
    pub data_root: PathBuf,
    pub dataset: String,
    pub gradient_accumulation_steps: usize,
    pub batch_size: usize,
    pub block_size: usize,

    // Model
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub dropout: f64,
    pub bias: bool,

    // AdamW
    pub learning_rate: f64,
    pub max_iters: usize,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub grad_clip: f64,

    // LR decay
    pub decay_lr: bool,
    pub warmup_iters: usize,
    pub lr_decay_iters: usize,
    pub min_lr: f64,

    // System
    pub backend: String,
    pub device: DeviceKind,
    pub dtype: Precision,
    pub compile: bool,
    pub seed: u64,
    pub peak_flops: f64,
    pub pretrained_dir: PathBuf,
    /// Chrome traces go here; `None` means `<out_dir>/traces`.
    pub trace_dir: Option<PathBuf>,
    pub dist_timeout_secs: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("out"),
            eval_interval: 2000,
            log_interval: 1,
            eval_iters: 200,
            eval_only: false,
            always_save_checkpoint: true,
            init_from: InitFrom::Scratch,
            metrics_log: false,
            run_name: "gpt2".into(),

            data_root: PathBuf::from("data"),
            dataset: "openwebtext".into(),
            gradient_accumulation_steps: 5 * 8,
            batch_size: 12,
            block_size: 1024,

            n_layer: 12,
            n_head: 12,
            n_embd: 768,
            dropout: 0.0,
            bias: false,

            learning_rate: 6e-4,
            max_iters: 600_000,
            weight_decay: 1e-1,
            beta1: 0.9,
            beta2: 0.95,
            grad_clip: 1.0,

            decay_lr: true,
            warmup_iters: 2000,
            lr_decay_iters: 600_000,
            min_lr: 6e-5,

            backend: "tcp".into(),
            device: DeviceKind::Auto,
            dtype: Precision::Bfloat16,
            compile: true,
            seed: 1337,
            // A100 bf16 peak.
            peak_flops: 312e12,
            pretrained_dir: PathBuf::from("pretrained"),
            trace_dir: None,
            dist_timeout_secs: 300,
        }
    }
}

impl TrainConfig {
    /// Defaults overridden by the keys present in a JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: TrainConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Apply one `key=value` override. The key must name an existing field and
    /// the value must parse as that field's type.
    pub fn apply_override(&mut self, assignment: &str) -> anyhow::Result<()> {
        let (key, raw) = assignment
            .split_once('=')
            .ok_or_else(|| TrainError::Config(format!("override '{assignment}' is not key=value")))?;
        let key = key.trim();
        let raw = raw.trim();

        let mut fields = serde_json::to_value(&*self)?;
        let obj = fields
            .as_object_mut()
            .ok_or_else(|| TrainError::Config("config did not serialise to an object".into()))?;
        let current = obj
            .get(key)
            .ok_or_else(|| TrainError::UnknownConfigKey(key.to_string()))?;

        let value = match current {
            // String-like fields take the raw text, quoted or not.
            Value::String(_) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::String(s)) => Value::String(s),
                _ => Value::String(raw.to_string()),
            },
            Value::Null => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
            _ => serde_json::from_str(raw)
                .map_err(|e| TrainError::Config(format!("bad value for {key}: '{raw}' ({e})")))?,
        };
        obj.insert(key.to_string(), value);

        *self = serde_json::from_value(fields)
            .map_err(|e| TrainError::Config(format!("bad value for {key}: '{raw}' ({e})")))?;
        Ok(())
    }

    /// Apply overrides in order.
    pub fn apply_overrides<S: AsRef<str>>(&mut self, assignments: &[S]) -> anyhow::Result<()> {
        for a in assignments {
            self.apply_override(a.as_ref())?;
        }
        Ok(())
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), TrainError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("block_size", self.block_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("eval_interval", self.eval_interval),
            ("log_interval", self.log_interval),
            ("eval_iters", self.eval_iters),
            ("n_layer", self.n_layer),
            ("n_head", self.n_head),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TrainError::Config(format!("{name} must be > 0")));
            }
        }
        if self.n_embd % self.n_head != 0 {
            return Err(TrainError::Config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TrainError::Config(format!("dropout must be in [0, 1), got {}", self.dropout)));
        }
        if self.grad_clip < 0.0 {
            return Err(TrainError::Config("grad_clip must be >= 0".into()));
        }
        if self.learning_rate <= 0.0 {
            return Err(TrainError::Config("learning_rate must be > 0".into()));
        }
        if self.decay_lr {
            if self.min_lr > self.learning_rate {
                return Err(TrainError::Config(format!(
                    "min_lr ({}) exceeds learning_rate ({})",
                    self.min_lr, self.learning_rate
                )));
            }
            if self.lr_decay_iters <= self.warmup_iters {
                return Err(TrainError::Config(format!(
                    "lr_decay_iters ({}) must exceed warmup_iters ({})",
                    self.lr_decay_iters, self.warmup_iters
                )));
            }
        }
        self.backend()?;
        Ok(())
    }

    pub fn backend(&self) -> Result<Backend, TrainError> {
        self.backend.parse()
    }

    /// `<data_root>/<dataset>`.
    pub fn data_dir(&self) -> PathBuf {
        self.data_root.join(&self.dataset)
    }

    pub fn trace_dir(&self) -> PathBuf {
        self.trace_dir
            .clone()
            .unwrap_or_else(|| self.out_dir.join("traces"))
    }

    /// Architecture requested by this config, with the given vocabulary.
    pub fn model_args(&self, vocab_size: usize) -> GptConfig {
        GptConfig {
            n_layer: self.n_layer,
            n_head: self.n_head,
            n_embd: self.n_embd,
            block_size: self.block_size,
            bias: self.bias,
            vocab_size,
            dropout: self.dropout,
        }
    }

    /// Full config as JSON, stored in checkpoints for provenance.
    pub fn to_json(&self) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TrainConfig::default();
        config.validate().unwrap();
        assert_eq!(config.gradient_accumulation_steps, 40);
        assert_eq!(config.seed, 1337);
    }

    #[test]
    fn file_overrides_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.json");
        std::fs::write(
            &path,
            r#"{"dataset": "shakespeare_char", "n_layer": 6, "dtype": "float16", "init_from": "pretrained:gpt2"}"#,
        )
        .unwrap();
        let config = TrainConfig::from_file(&path).unwrap();
        assert_eq!(config.dataset, "shakespeare_char");
        assert_eq!(config.n_layer, 6);
        assert_eq!(config.n_head, 12);
        assert_eq!(config.dtype, Precision::Float16);
        assert_eq!(config.init_from, InitFrom::Pretrained("gpt2".into()));
    }

    #[test]
    fn file_with_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"n_layers": 6}"#).unwrap();
        assert!(TrainConfig::from_file(&path).is_err());
    }

    #[test]
    fn overrides_are_typed_by_field() {
        let mut config = TrainConfig::default();
        config
            .apply_overrides(&[
                "batch_size=32",
                "learning_rate=1e-3",
                "compile=false",
                "dataset=shakespeare_char",
                "out_dir=\"out-shakespeare\"",
                "init_from=resume",
                "trace_dir=/tmp/traces",
                "device=cpu",
            ])
            .unwrap();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.learning_rate, 1e-3);
        assert!(!config.compile);
        assert_eq!(config.dataset, "shakespeare_char");
        assert_eq!(config.out_dir, PathBuf::from("out-shakespeare"));
        assert_eq!(config.init_from, InitFrom::Resume);
        assert_eq!(config.trace_dir(), PathBuf::from("/tmp/traces"));
        assert_eq!(config.device, DeviceKind::Cpu);
    }

    #[test]
    fn unknown_override_key_is_rejected() {
        let mut config = TrainConfig::default();
        let err = config.apply_override("n_layers=4").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::UnknownConfigKey(k)) if k == "n_layers"
        ));
        // Nothing changed.
        assert_eq!(config, TrainConfig::default());
    }

    #[test]
    fn mistyped_override_is_rejected() {
        let mut config = TrainConfig::default();
        assert!(config.apply_override("batch_size=1.5").is_err());
        assert!(config.apply_override("compile=maybe").is_err());
        assert!(config.apply_override("dtype=float64").is_err());
        assert!(config.apply_override("init_from=somewhere").is_err());
        assert!(config.apply_override("batch_size").is_err());
    }

    #[test]
    fn validation_catches_bad_schedules_and_backends() {
        let config = TrainConfig {
            min_lr: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TrainConfig {
            warmup_iters: 10,
            lr_decay_iters: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TrainConfig {
            backend: "nccl".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TrainError::UnsupportedBackend(_))));

        let config = TrainConfig {
            n_embd: 100,
            n_head: 12,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn cpu_always_computes_in_f32() {
        assert_eq!(Precision::Bfloat16.compute_dtype(&Device::Cpu), DType::F32);
        assert_eq!(Precision::Float16.effective(&Device::Cpu), Precision::Float32);
    }
}
