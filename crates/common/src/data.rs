//! Token corpus access and random-window batch sampling.
//!
//! A dataset directory holds two flat token streams produced by an external
//! tokenizer:
//!
//! * `train.bin` / `val.bin`: little-endian `u16` token ids, no header.
//! * `meta.json` (optional): `{ "vocab_size": N }`.
//!
//! * **[`TokenCorpus`]**: locates the split files and maps them read-only.
//! * **[`BatchSampler`]**: draws `(batch_size, block_size)` windows at random
//!   offsets; labels are the inputs shifted by one token.
//! * **[`HostBatch`]** / **[`Batch`]**: host-side tokens and their device tensors.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

/// Bytes per token id in the corpus files.
pub const TOKEN_BYTES: usize = 2;

// ── Errors ──────────────────────────────────────────────────────────────────

/// Corpus problems are fatal at startup and on every sample.
#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("corpus file not found: {0}")]
    Missing(PathBuf),
    #[error("corpus {path} holds {tokens} tokens; need more than block_size {block_size}")]
    TooShort {
        path: PathBuf,
        tokens: usize,
        block_size: usize,
    },
    #[error("corpus {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

// ── Split ───────────────────────────────────────────────────────────────────

/// Which token stream to draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub const ALL: [Split; 2] = [Split::Train, Split::Val];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            Split::Train => "train.bin",
            Split::Val => "val.bin",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── TokenCorpus ─────────────────────────────────────────────────────────────

/// A dataset directory containing `train.bin`, `val.bin` and maybe `meta.json`.
#[derive(Debug, Clone)]
pub struct TokenCorpus {
    dir: PathBuf,
}

#[derive(Deserialize)]
struct CorpusMeta {
    vocab_size: usize,
}

impl TokenCorpus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn split_path(&self, split: Split) -> PathBuf {
        self.dir.join(split.file_name())
    }

    /// Map one split read-only. Called afresh for every batch so that pages of a
    /// very large corpus are not pinned across the whole run.
    pub fn open(&self, split: Split) -> AnyhowResult<CorpusView> {
        let path = self.split_path(split);
        let file = File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => anyhow::Error::new(CorpusError::Missing(path.clone())),
            _ => anyhow::Error::new(e).context(format!("open {}", path.display())),
        })?;
        // SAFETY: the corpus is produced ahead of time and never written while
        // training reads it.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mmap {}", path.display()))?;
        if mmap.len() % TOKEN_BYTES != 0 {
            return Err(CorpusError::Malformed {
                path,
                reason: format!("byte length {} is not a multiple of {TOKEN_BYTES}", mmap.len()),
            }
            .into());
        }
        Ok(CorpusView { path, mmap })
    }

    /// Vocabulary size reported by `meta.json`, if the file exists.
    pub fn vocab_size(&self) -> AnyhowResult<Option<usize>> {
        let path = self.dir.join("meta.json");
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let meta: CorpusMeta = serde_json::from_str(&json)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(meta.vocab_size))
    }
}

/// Read-only view over one mapped split.
pub struct CorpusView {
    path: PathBuf,
    mmap: Mmap,
}

impl CorpusView {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_tokens(&self) -> usize {
        self.mmap.len() / TOKEN_BYTES
    }

    #[inline]
    fn token_at(&self, index: usize) -> u32 {
        let i = index * TOKEN_BYTES;
        u16::from_le_bytes([self.mmap[i], self.mmap[i + 1]]) as u32
    }

    /// Copy `len` tokens starting at `start` into `out`.
    fn extend_window(&self, start: usize, len: usize, out: &mut Vec<u32>) {
        out.extend((start..start + len).map(|i| self.token_at(i)));
    }
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// Host-side batch: row-major `(batch_size, block_size)` inputs and targets.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBatch {
    pub offsets: Vec<usize>,
    pub inputs: Vec<u32>,
    pub targets: Vec<u32>,
    pub batch_size: usize,
    pub block_size: usize,
}

impl HostBatch {
    /// Move the tokens to `device` as two `u32` tensors.
    pub fn to_device(&self, device: &Device) -> Result<Batch> {
        let (input, target) = batch_to_tensors(
            &self.inputs,
            &self.targets,
            self.batch_size,
            self.block_size,
            device,
        )?;
        Ok(Batch { input, target })
    }
}

/// Device-resident batch consumed by one forward pass.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input: Tensor,
    pub target: Tensor,
}

/// Draws random fixed-length windows from a [`TokenCorpus`].
///
/// The generator is seeded once; two samplers built with the same seed over the
/// same corpus yield the same offsets in the same order.
pub struct BatchSampler {
    corpus: TokenCorpus,
    batch_size: usize,
    block_size: usize,
    rng: StdRng,
}

impl BatchSampler {
    pub fn new(corpus: TokenCorpus, batch_size: usize, block_size: usize, seed: u64) -> Self {
        Self {
            corpus,
            batch_size,
            block_size,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn corpus(&self) -> &TokenCorpus {
        &self.corpus
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Check that `split` exists and is long enough for one window.
    pub fn check(&self, split: Split) -> AnyhowResult<usize> {
        let view = self.corpus.open(split)?;
        self.ensure_long_enough(&view)?;
        Ok(view.num_tokens())
    }

    fn ensure_long_enough(&self, view: &CorpusView) -> AnyhowResult<()> {
        if view.num_tokens() <= self.block_size {
            return Err(CorpusError::TooShort {
                path: view.path().to_path_buf(),
                tokens: view.num_tokens(),
                block_size: self.block_size,
            }
            .into());
        }
        Ok(())
    }

    /// Sample one batch of windows from `split`.
    pub fn sample(&mut self, split: Split) -> AnyhowResult<HostBatch> {
        let view = self.corpus.open(split)?;
        self.ensure_long_enough(&view)?;

        let upper = view.num_tokens() - self.block_size;
        let offsets: Vec<usize> = (0..self.batch_size)
            .map(|_| self.rng.gen_range(0..upper))
            .collect();

        let mut inputs = Vec::with_capacity(self.batch_size * self.block_size);
        let mut targets = Vec::with_capacity(self.batch_size * self.block_size);
        for &start in &offsets {
            view.extend_window(start, self.block_size, &mut inputs);
            view.extend_window(start + 1, self.block_size, &mut targets);
        }
        Ok(HostBatch {
            offsets,
            inputs,
            targets,
            batch_size: self.batch_size,
            block_size: self.block_size,
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Convert a raw batch of `(input_ids, labels)` to Candle tensors.
pub fn batch_to_tensors(
    input_ids: &[u32],
    labels: &[u32],
    batch_size: usize,
    seq_len: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let input = Tensor::from_vec(input_ids.to_vec(), (batch_size, seq_len), device)?;
    let labels = Tensor::from_vec(labels.to_vec(), (batch_size, seq_len), device)?;
    Ok((input, labels))
}

/// Write a token stream in the corpus format (flat little-endian `u16`).
pub fn write_token_file(path: &Path, tokens: &[u16]) -> AnyhowResult<()> {
    let mut f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut bytes = Vec::with_capacity(tokens.len() * TOKEN_BYTES);
    for &t in tokens {
        bytes.extend_from_slice(&t.to_le_bytes());
    }
    f.write_all(&bytes)?;
    f.sync_all().context("sync token file")?;
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
