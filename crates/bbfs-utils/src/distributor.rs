//! Deterministic chunk-to-daemon placement.
//!
//! `locate_data` is a pure function of `(path, chunk_id)`: no state, no
//! failure mode, identical on every process that shares the same
//! `host_size`.  Changing `host_size` invalidates all placements and is
//! treated as a fresh file system.

use bbfs_types::{ChunkId, HostId};

use crate::murmur3::murmurhash3_x64_64;

/// Seed for placement hashing.  Fixed forever; see module docs.
const PLACEMENT_SEED: u64 = 0;

/// Maps `(path, chunk_id)` to the daemon that owns the chunk.
pub trait Distributor: Send + Sync {
    /// Number of daemons in the deployment.
    fn host_size(&self) -> u32;

    /// Daemon owning chunk `chunk_id` of `path`.  Always in
    /// `[0, host_size)`.
    fn locate_data(&self, path: &str, chunk_id: ChunkId) -> HostId;
}

/// Hash-based placement: murmur3 over the path bytes concatenated with the
/// little-endian chunk id, reduced modulo `host_size`.
#[derive(Debug, Clone)]
pub struct SimpleHashDistributor {
    host_size: u32,
}

impl SimpleHashDistributor {
    pub fn new(host_size: u32) -> Self {
        assert!(host_size > 0, "deployment needs at least one daemon");
        Self { host_size }
    }
}

impl Distributor for SimpleHashDistributor {
    fn host_size(&self) -> u32 {
        self.host_size
    }

    fn locate_data(&self, path: &str, chunk_id: ChunkId) -> HostId {
        let mut key = Vec::with_capacity(path.len() + 8);
        key.extend_from_slice(path.as_bytes());
        key.extend_from_slice(&chunk_id.to_le_bytes());
        let hash = murmurhash3_x64_64(&key, PLACEMENT_SEED);
        HostId((hash % self.host_size as u64) as u32)
    }
}
