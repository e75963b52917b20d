//! Process-group membership for one training process.
//!
//! A multi-process launch sets `RANK`, `LOCAL_RANK` and `WORLD_SIZE` (plus
//! `MASTER_ADDR`/`MASTER_PORT`) for every worker. Without them the run is a
//! single process on one device.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use candle_core::Device;
use tracing::info;

use crate::collective::{Collective, SingleProcess, TcpCollective};
use crate::config::{Backend, TrainConfig};
use crate::error::TrainError;

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;

/// Who this process is within the group, and the handle to talk to the rest.
pub struct DistributedContext {
    distributed: bool,
    rank: usize,
    local_rank: usize,
    world_size: usize,
    device: Device,
    seed: u64,
    collective: Arc<dyn Collective>,
}

impl DistributedContext {
    /// Read the launcher environment and join the group if there is one.
    pub fn initialize(config: &TrainConfig) -> anyhow::Result<Self> {
        Self::from_env(config, |key| std::env::var(key).ok())
    }

    /// [`initialize`](Self::initialize) with an explicit environment lookup.
    pub fn from_env<F>(config: &TrainConfig, env: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(rank) = env("RANK") else {
            let device = config.device.resolve(0)?;
            return Self::with_collective(false, 0, 0, device, config.seed, Arc::new(SingleProcess));
        };

        let parse = |key: &str, raw: String| -> Result<usize, TrainError> {
            raw.trim()
                .parse()
                .map_err(|_| TrainError::Config(format!("{key}='{raw}' is not a non-negative integer")))
        };
        let missing = |key: &str| TrainError::Config(format!("RANK is set but {key} is not"));

        let rank = parse("RANK", rank)?;
        let local_rank = parse("LOCAL_RANK", env("LOCAL_RANK").ok_or_else(|| missing("LOCAL_RANK"))?)?;
        let world_size = parse("WORLD_SIZE", env("WORLD_SIZE").ok_or_else(|| missing("WORLD_SIZE"))?)?;
        if world_size == 0 || rank >= world_size {
            return Err(TrainError::Config(format!("RANK {rank} is outside WORLD_SIZE {world_size}")).into());
        }

        let addr = master_addr(&env)?;
        let timeout = Duration::from_secs(config.dist_timeout_secs);
        let collective: Arc<dyn Collective> = match config.backend()? {
            Backend::Tcp => Arc::new(TcpCollective::connect(rank, world_size, addr, timeout)?),
        };
        info!("rank {rank}/{world_size} joined group at {addr} (local rank {local_rank})");

        let device = config
            .device
            .resolve(local_rank)
            .with_context(|| format!("binding device for local rank {local_rank}"))?;
        Self::with_collective(true, rank, local_rank, device, config.seed, collective)
    }

    /// Single-process context on a given device.
    pub fn single(device: Device, seed: u64) -> anyhow::Result<Self> {
        Self::with_collective(false, 0, 0, device, seed, Arc::new(SingleProcess))
    }

    /// Context around an already joined collective.
    pub fn with_collective(
        distributed: bool,
        rank: usize,
        local_rank: usize,
        device: Device,
        base_seed: u64,
        collective: Arc<dyn Collective>,
    ) -> anyhow::Result<Self> {
        let seed = base_seed + rank as u64;
        // candle has no seedable CPU generator; host-side sampling uses `seed` directly.
        if !device.is_cpu() {
            device.set_seed(seed)?;
        }
        Ok(Self {
            distributed,
            rank,
            local_rank,
            world_size: collective.world_size(),
            device,
            seed,
            collective,
        })
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Rank 0 logs, evaluates and writes checkpoints.
    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Per-rank seed: configured seed plus rank.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn collective(&self) -> &dyn Collective {
        self.collective.as_ref()
    }

    /// Shared handle for components that outlive a borrow of the context.
    pub fn collective_handle(&self) -> Arc<dyn Collective> {
        Arc::clone(&self.collective)
    }

    /// Share of the global accumulation window this process runs.
    pub fn per_process_accumulation(&self, steps: usize) -> Result<usize, TrainError> {
        if steps % self.world_size != 0 {
            return Err(TrainError::AccumulationNotDivisible {
                steps,
                world_size: self.world_size,
            });
        }
        Ok(steps / self.world_size)
    }

    /// Tokens consumed by one optimizer step across the whole group.
    pub fn tokens_per_iteration(&self, per_process_steps: usize, batch_size: usize, block_size: usize) -> usize {
        per_process_steps * self.world_size * batch_size * block_size
    }

    /// Final barrier and release of the group. Consumes the context.
    pub fn shutdown(self) -> Result<(), TrainError> {
        if self.distributed {
            info!("rank {} leaving group", self.rank);
        }
        self.collective.shutdown()
    }
}

fn master_addr<F>(env: &F) -> Result<SocketAddr, TrainError>
where
    F: Fn(&str) -> Option<String>,
{
    let host = env("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
    let port = match env("MASTER_PORT") {
        Some(p) => p
            .trim()
            .parse::<u16>()
            .map_err(|_| TrainError::Config(format!("MASTER_PORT='{p}' is not a port")))?,
        None => DEFAULT_MASTER_PORT,
    };
    (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| TrainError::Config(format!("cannot resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| TrainError::Config(format!("{host}:{port} resolved to nothing")))
}
