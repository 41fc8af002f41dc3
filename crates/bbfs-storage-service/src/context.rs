//! Daemon configuration and the context value threaded through handlers.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use bbfs_net::BulkRegistry;
use bbfs_types::HostId;

use crate::chunk_storage::ChunkStorage;
use crate::error::StorageResult;
use crate::stats::Stats;

/// Tunables of one daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Absolute, pre-existing directory holding the chunk store.
    pub root_path: PathBuf,

    /// Chunk size in bytes.  Must be identical on every daemon and client
    /// of the deployment.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// This daemon's id in `[0, host_size)`.
    #[serde(default)]
    pub host_id: u32,

    /// Number of daemons in the deployment.
    #[serde(default = "default_host_size")]
    pub host_size: u32,

    /// Upper bound on concurrently running disk tasklets.
    #[serde(default = "default_tasklet_workers")]
    pub tasklet_workers: usize,

    /// Aggregate byte counters.
    #[serde(default)]
    pub enable_stats: bool,

    /// Per-chunk access counters.
    #[serde(default)]
    pub enable_chunkstats: bool,
}

fn default_chunk_size() -> u64 {
    512 * 1024
}

fn default_host_size() -> u32 {
    1
}

fn default_tasklet_workers() -> usize {
    8
}

/// Everything a handler or tasklet needs, passed explicitly.
///
/// Deliberately a plain value behind an `Arc`: there is no ambient daemon
/// singleton anywhere in this crate.
pub struct DaemonContext {
    config: DaemonConfig,
    storage: Arc<ChunkStorage>,
    transport: Arc<BulkRegistry>,
    limiter: Arc<Semaphore>,
    stats: Arc<Stats>,
}

impl DaemonContext {
    /// Build the context, opening the chunk store.  Fails if `root_path`
    /// is unusable; the daemon must not come up in that case.
    pub fn new(config: DaemonConfig, transport: Arc<BulkRegistry>) -> StorageResult<Self> {
        let storage = Arc::new(ChunkStorage::new(
            config.root_path.clone(),
            config.chunk_size,
        )?);
        let limiter = Arc::new(Semaphore::new(config.tasklet_workers.max(1)));
        Ok(Self {
            storage,
            transport,
            limiter,
            stats: Arc::new(Stats::new()),
            config,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn host_id(&self) -> HostId {
        HostId(self.config.host_id)
    }

    pub fn storage(&self) -> &Arc<ChunkStorage> {
        &self.storage
    }

    pub fn transport(&self) -> &Arc<BulkRegistry> {
        &self.transport
    }

    pub fn limiter(&self) -> &Arc<Semaphore> {
        &self.limiter
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }
}
