//! Single-sided bulk transfers between registered buffers.
//!
//! One [`BulkRegistry`] models one transport endpoint's registered memory.
//! A registration yields a [`BulkBuf`] whose [`BulkDescriptor`] can travel
//! inside an RPC request; the peer resolves the descriptor against the same
//! registry and moves bytes with [`BulkRegistry::transfer`] without
//! involving the registering side.  Dropping the `BulkBuf` deregisters the
//! buffer, which gives the scoped-release behavior the handlers rely on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use bbfs_proto::BulkDescriptor;

use crate::error::NetError;

/// Access mode requested at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    /// Remote side may only read (source of pulls).
    ReadOnly,
    /// Remote side may only write (target of pushes).
    WriteOnly,
    /// Remote side may read and write.
    ReadWrite,
}

impl BulkMode {
    fn remote_readable(self) -> bool {
        matches!(self, BulkMode::ReadOnly | BulkMode::ReadWrite)
    }

    fn remote_writable(self) -> bool {
        matches!(self, BulkMode::WriteOnly | BulkMode::ReadWrite)
    }
}

/// Direction of a transfer, named from the initiator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkDirection {
    /// Copy remote bytes into the local buffer.
    Pull,
    /// Copy local bytes into the remote buffer.
    Push,
}

#[derive(Clone)]
struct Region {
    data: Arc<RwLock<Vec<u8>>>,
    mode: BulkMode,
}

/// Registered-memory table of one transport endpoint.
pub struct BulkRegistry {
    regions: DashMap<u64, Region>,
    next_id: AtomicU64,
}

impl BulkRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            regions: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Allocate and register a zero-filled buffer of `len` bytes.  Used by
    /// servers for the per-RPC staging buffer.
    pub fn create(self: &Arc<Self>, len: usize, mode: BulkMode) -> BulkBuf {
        self.insert(vec![0u8; len], mode)
    }

    /// Register a caller-owned buffer.  The registration snapshots the
    /// bytes; a `WriteOnly` registration starts zero-filled regardless of
    /// the source, matching remote-write-target semantics.
    pub fn register(self: &Arc<Self>, bytes: &[u8], mode: BulkMode) -> BulkBuf {
        let data = match mode {
            BulkMode::WriteOnly => vec![0u8; bytes.len()],
            _ => bytes.to_vec(),
        };
        self.insert(data, mode)
    }

    fn insert(self: &Arc<Self>, data: Vec<u8>, mode: BulkMode) -> BulkBuf {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let len = data.len() as u64;
        let data = Arc::new(RwLock::new(data));
        self.regions.insert(
            id,
            Region {
                data: Arc::clone(&data),
                mode,
            },
        );
        BulkBuf {
            registry: Arc::clone(self),
            id,
            data,
            len,
        }
    }

    fn resolve(&self, desc: &BulkDescriptor) -> Result<Region, NetError> {
        self.regions
            .get(&desc.id)
            .map(|r| r.clone())
            .ok_or(NetError::InvalidBulkHandle(desc.id))
    }

    /// Move `size` bytes between a remote registered buffer and a local one.
    ///
    /// `Pull` copies `remote[remote_offset..]` into `local[local_offset..]`;
    /// `Push` copies the other way.  The remote buffer's registration mode
    /// is enforced; both ranges are bounds-checked before any byte moves.
    pub fn transfer(
        &self,
        direction: BulkDirection,
        remote: &BulkDescriptor,
        remote_offset: u64,
        local: &BulkBuf,
        local_offset: u64,
        size: u64,
    ) -> Result<(), NetError> {
        let region = self.resolve(remote)?;
        let allowed = match direction {
            BulkDirection::Pull => region.mode.remote_readable(),
            BulkDirection::Push => region.mode.remote_writable(),
        };
        if !allowed {
            return Err(NetError::BulkModeViolation {
                mode: region.mode,
                direction,
            });
        }
        check_range(remote_offset, size, region.data.read().len() as u64)?;
        check_range(local_offset, size, local.len)?;

        let (r_off, l_off, n) = (remote_offset as usize, local_offset as usize, size as usize);
        if Arc::ptr_eq(&region.data, &local.data) {
            // Same registration on both sides: a plain read+write lock pair
            // would deadlock, so move the bytes under one write lock.
            let mut data = local.data.write();
            match direction {
                BulkDirection::Pull => data.copy_within(r_off..r_off + n, l_off),
                BulkDirection::Push => data.copy_within(l_off..l_off + n, r_off),
            }
            return Ok(());
        }

        match direction {
            BulkDirection::Pull => {
                let src = region.data.read();
                let mut dst = local.data.write();
                dst[l_off..l_off + n].copy_from_slice(&src[r_off..r_off + n]);
            }
            BulkDirection::Push => {
                let src = local.data.read();
                let mut dst = region.data.write();
                dst[r_off..r_off + n].copy_from_slice(&src[l_off..l_off + n]);
            }
        }
        Ok(())
    }
}

fn check_range(offset: u64, size: u64, len: u64) -> Result<(), NetError> {
    if offset.checked_add(size).map_or(true, |end| end > len) {
        return Err(NetError::BulkOutOfBounds { offset, size, len });
    }
    Ok(())
}

/// A live registration.  Dropping it removes the buffer from the registry.
pub struct BulkBuf {
    registry: Arc<BulkRegistry>,
    id: u64,
    data: Arc<RwLock<Vec<u8>>>,
    len: u64,
}

impl BulkBuf {
    /// Descriptor to embed in an RPC request.
    pub fn descriptor(&self) -> BulkDescriptor {
        BulkDescriptor {
            id: self.id,
            len: self.len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the buffer at `offset` (local access, no transfer).
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), NetError> {
        check_range(offset, data.len() as u64, self.len)?;
        let off = offset as usize;
        self.data.write()[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy `size` bytes out of the buffer starting at `offset`.
    pub fn slice(&self, offset: u64, size: u64) -> Result<Bytes, NetError> {
        check_range(offset, size, self.len)?;
        let (off, n) = (offset as usize, size as usize);
        Ok(Bytes::copy_from_slice(&self.data.read()[off..off + n]))
    }

    /// Copy a range of the buffer into `out`.  Used by the client to move
    /// pushed read data back into the caller's buffer after the fan-out
    /// drains.
    pub fn copy_out(&self, offset: u64, out: &mut [u8]) -> Result<(), NetError> {
        check_range(offset, out.len() as u64, self.len)?;
        let off = offset as usize;
        out.copy_from_slice(&self.data.read()[off..off + out.len()]);
        Ok(())
    }
}

impl Drop for BulkBuf {
    fn drop(&mut self) {
        self.registry.regions.remove(&self.id);
    }
}
