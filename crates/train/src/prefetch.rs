//! Background batch preparation.
//!
//! A producer thread owns the training sampler, draws the next batch and moves
//! it to the device while the main thread runs backward. A bounded channel of
//! depth one keeps exactly one batch in flight.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use anyhow::anyhow;
use candle_core::Device;
use tracing::debug;

use forge_common::{Batch, BatchSampler, Split};

/// Batches in flight between producer and consumer.
const PREFETCH_BUFFER: usize = 1;

/// Anything that can hand out device-resident training batches.
pub trait BatchSource {
    fn next_batch(&mut self) -> anyhow::Result<Batch>;
}

/// Samples and transfers on the calling thread.
pub struct InlineSource {
    sampler: BatchSampler,
    split: Split,
    device: Device,
}

impl InlineSource {
    pub fn new(sampler: BatchSampler, split: Split, device: Device) -> Self {
        Self {
            sampler,
            split,
            device,
        }
    }
}

impl BatchSource for InlineSource {
    fn next_batch(&mut self) -> anyhow::Result<Batch> {
        let host = self.sampler.sample(self.split)?;
        Ok(host.to_device(&self.device)?)
    }
}

/// Samples and transfers on a dedicated thread.
pub struct Prefetcher {
    rx: Option<Receiver<anyhow::Result<Batch>>>,
    handle: Option<JoinHandle<()>>,
}

impl Prefetcher {
    pub fn spawn(sampler: BatchSampler, split: Split, device: Device) -> Self {
        let (tx, rx) = mpsc::sync_channel(PREFETCH_BUFFER);
        let handle = thread::spawn(move || produce(InlineSource::new(sampler, split, device), tx));
        Self {
            rx: Some(rx),
            handle: Some(handle),
        }
    }
}

fn produce(mut source: InlineSource, tx: SyncSender<anyhow::Result<Batch>>) {
    loop {
        let batch = source.next_batch();
        let failed = batch.is_err();
        if tx.send(batch).is_err() {
            debug!("prefetch consumer gone, stopping");
            return;
        }
        // A sampling error is fatal downstream; no point producing more.
        if failed {
            return;
        }
    }
}

impl BatchSource for Prefetcher {
    fn next_batch(&mut self) -> anyhow::Result<Batch> {
        let rx = self
            .rx
            .as_ref()
            .ok_or_else(|| anyhow!("prefetcher already stopped"))?;
        rx.recv()
            .map_err(|_| anyhow!("prefetch thread exited unexpectedly"))?
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        // Dropping the receiver unblocks a producer waiting in `send`.
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_common::{write_token_file, TokenCorpus};

    fn corpus() -> (tempfile::TempDir, TokenCorpus) {
        let dir = tempfile::tempdir().unwrap();
        let tokens: Vec<u16> = (0..500).map(|i| (i % 50) as u16).collect();
        write_token_file(&dir.path().join("train.bin"), &tokens).unwrap();
        write_token_file(&dir.path().join("val.bin"), &tokens).unwrap();
        let corpus = TokenCorpus::new(dir.path());
        (dir, corpus)
    }

    #[test]
    fn prefetched_batches_match_inline_sequence() {
        let (_dir, corpus) = corpus();
        let mut inline = InlineSource::new(BatchSampler::new(corpus.clone(), 4, 8, 7), Split::Train, Device::Cpu);
        let mut prefetch = Prefetcher::spawn(BatchSampler::new(corpus, 4, 8, 7), Split::Train, Device::Cpu);
        for _ in 0..5 {
            let a = inline.next_batch().unwrap();
            let b = prefetch.next_batch().unwrap();
            assert_eq!(
                a.input.to_vec2::<u32>().unwrap(),
                b.input.to_vec2::<u32>().unwrap()
            );
            assert_eq!(a.input.dims(), &[4, 8]);
        }
    }

    #[test]
    fn sampling_errors_surface_to_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = TokenCorpus::new(dir.path());
        let mut prefetch = Prefetcher::spawn(BatchSampler::new(corpus, 2, 8, 0), Split::Train, Device::Cpu);
        assert!(prefetch.next_batch().is_err());
        // Producer has exited; further reads fail instead of hanging.
        assert!(prefetch.next_batch().is_err());
    }

    #[test]
    fn drop_joins_blocked_producer() {
        let (_dir, corpus) = corpus();
        let prefetch = Prefetcher::spawn(BatchSampler::new(corpus, 2, 8, 0), Split::Train, Device::Cpu);
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(prefetch);
    }
}
