//! # forge-common: Shared Primitives
//!
//! Types shared by every crate in the workspace:
//!
//! * **[`GptConfig`]**: architecture arguments of the model (serialised as JSON).
//! * **[`TokenCorpus`]** / **[`BatchSampler`]**: pre-tokenised corpus access and
//!   random-window batching.
//! * **[`batch_to_tensors`]**: raw batch → Candle tensors.

pub mod config;
pub mod data;

pub use config::{GptConfig, FALLBACK_VOCAB_SIZE};
pub use data::{
    batch_to_tensors, write_token_file, Batch, BatchSampler, CorpusError, HostBatch, Split,
    TokenCorpus,
};
