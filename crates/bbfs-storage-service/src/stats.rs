//! I/O counters, updated from handlers and tasklets.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::info;

use bbfs_types::ChunkId;

/// Aggregate size counters are kept per operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOp {
    Read,
    Write,
}

/// Per-daemon statistics.  All updates are atomic or map-sharded; counters
/// are bumped from concurrently running tasks.  Whether the handlers bump
/// them at all is governed by the daemon config toggles.
#[derive(Debug, Default)]
pub struct Stats {
    write_ops: AtomicU64,
    read_ops: AtomicU64,
    write_bytes: AtomicU64,
    read_bytes: AtomicU64,
    chunk_writes: DashMap<(String, ChunkId), u64>,
    chunk_reads: DashMap<(String, ChunkId), u64>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one chunk write of `path`.
    pub fn add_write(&self, path: &str, chunk_id: ChunkId) {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        *self
            .chunk_writes
            .entry((path.to_string(), chunk_id))
            .or_insert(0) += 1;
    }

    /// Record one chunk read of `path`.
    pub fn add_read(&self, path: &str, chunk_id: ChunkId) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        *self
            .chunk_reads
            .entry((path.to_string(), chunk_id))
            .or_insert(0) += 1;
    }

    /// Record the byte size of one operation.
    pub fn add_value_size(&self, op: SizeOp, size: u64) {
        match op {
            SizeOp::Read => self.read_bytes.fetch_add(size, Ordering::Relaxed),
            SizeOp::Write => self.write_bytes.fetch_add(size, Ordering::Relaxed),
        };
    }

    pub fn write_ops(&self) -> u64 {
        self.write_ops.load(Ordering::Relaxed)
    }

    pub fn read_ops(&self) -> u64 {
        self.read_ops.load(Ordering::Relaxed)
    }

    pub fn write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Relaxed)
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    /// Times chunk `chunk_id` of `path` was written.
    pub fn chunk_write_count(&self, path: &str, chunk_id: ChunkId) -> u64 {
        self.chunk_writes
            .get(&(path.to_string(), chunk_id))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Times chunk `chunk_id` of `path` was read.
    pub fn chunk_read_count(&self, path: &str, chunk_id: ChunkId) -> u64 {
        self.chunk_reads
            .get(&(path.to_string(), chunk_id))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// Log the aggregate counters.
    pub fn report(&self) {
        info!(
            write_ops = self.write_ops(),
            read_ops = self.read_ops(),
            write_bytes = self.write_bytes(),
            read_bytes = self.read_bytes(),
            "daemon i/o statistics"
        );
    }
}
