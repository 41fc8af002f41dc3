//! Scatter/gather dispatch of read and write operations.
//!
//! A single user-level operation fans out into at most one RPC per daemon:
//! the buffer is registered once per distinct transport endpoint, each
//! owning daemon receives the ordered list of its chunks encoded as a
//! bitmap, and all RPCs are issued concurrently.  Responses are always
//! drained completely, even after a failure, so registrations and wait
//! handles are released on every path.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use bbfs_net::{call_with_retry, BulkBuf, BulkMode, BulkRegistry, Directory, NetError};
use bbfs_proto::bitset::{bitset_with_capacity, set_bit};
use bbfs_proto::{BulkDescriptor, ChunkStatRsp, DataRsp, ReadChunkReq, WriteChunkReq};
use bbfs_types::errno::{EBUSY, ERRNO_OK};
use bbfs_types::{ChunkId, HostId};
use bbfs_utils::arith;
use bbfs_utils::Distributor;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// One buffer registration per distinct transport endpoint, indexed by the
/// targets that use it.  Dropped only after every response has drained.
struct TargetRegistrations {
    regs: Vec<(Arc<BulkRegistry>, BulkBuf)>,
    by_target: HashMap<HostId, usize>,
}

impl TargetRegistrations {
    fn descriptor_for(&self, target: HostId) -> BulkDescriptor {
        self.regs[self.by_target[&target]].1.descriptor()
    }

    fn buf_for(&self, target: HostId) -> &BulkBuf {
        &self.regs[self.by_target[&target]].1
    }
}

/// Client-side entry point of the data plane.
pub struct DataDispatcher {
    config: ClientConfig,
    directory: Arc<Directory>,
    distributor: Arc<dyn Distributor>,
}

impl DataDispatcher {
    pub fn new(
        config: ClientConfig,
        directory: Arc<Directory>,
        distributor: Arc<dyn Distributor>,
    ) -> Self {
        Self {
            config,
            directory,
            distributor,
        }
    }

    /// Write `buf` at `offset`.  With `append`, the metadata layer has
    /// already reserved the space and the effective offset is
    /// `new_file_size - buf.len()`.  Returns the bytes written.
    pub async fn write(
        &self,
        path: &str,
        buf: &[u8],
        append: bool,
        offset: u64,
        new_file_size: u64,
    ) -> ClientResult<u64> {
        let size = buf.len() as u64;
        if size == 0 {
            return Ok(0);
        }
        let offset = if append {
            new_file_size
                .checked_sub(size)
                .ok_or_else(|| {
                    ClientError::InvalidArgument(format!(
                        "append of {} bytes onto file of {} bytes",
                        size, new_file_size
                    ))
                })?
        } else {
            offset
        };

        let chunksize = self.config.chunk_size;
        let chunk_start = arith::chunk_id_for_offset(offset, chunksize);
        let chunk_end = arith::chunk_id_for_offset(offset + size - 1, chunksize);
        let targets = self.bucketize(path, chunk_start, chunk_end);
        debug!(
            path,
            offset,
            size,
            chunk_start,
            chunk_end,
            targets = targets.len(),
            "dispatching write"
        );

        let registrations = self.register_targets(&targets, buf, BulkMode::ReadOnly)?;

        let mut rpcs: JoinSet<(HostId, Result<DataRsp, NetError>)> = JoinSet::new();
        for (&target, chunks) in &targets {
            let endpoint = self.directory.endpoint(target)?.clone();
            let req = self.build_write_req(
                path,
                offset,
                size,
                chunk_start,
                chunk_end,
                target,
                chunks,
                registrations.descriptor_for(target),
            );
            let policy = self.config.retry_policy();
            rpcs.spawn(async move {
                let service = endpoint.service;
                let result = call_with_retry(policy, || {
                    let req = req.clone();
                    let service = Arc::clone(&service);
                    async move { service.write(req).await }
                })
                .await;
                (target, result)
            });
        }

        let (err, total_io) = drain_data_rpcs(&mut rpcs).await;
        drop(registrations);
        if err != ERRNO_OK {
            return Err(ClientError::Remote(err));
        }
        Ok(total_io)
    }

    /// Read into `buf` from `offset`.  Returns the bytes actually read;
    /// holes and EOF shorten the count without raising an error.
    pub async fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> ClientResult<u64> {
        let size = buf.len() as u64;
        if size == 0 {
            return Ok(0);
        }

        let chunksize = self.config.chunk_size;
        let chunk_start = arith::chunk_id_for_offset(offset, chunksize);
        let chunk_end = arith::chunk_id_for_offset(offset + size - 1, chunksize);
        let targets = self.bucketize(path, chunk_start, chunk_end);
        debug!(
            path,
            offset,
            size,
            chunk_start,
            chunk_end,
            targets = targets.len(),
            "dispatching read"
        );

        let registrations = self.register_targets(&targets, buf, BulkMode::WriteOnly)?;

        let mut rpcs: JoinSet<(HostId, Result<DataRsp, NetError>)> = JoinSet::new();
        for (&target, chunks) in &targets {
            let endpoint = self.directory.endpoint(target)?.clone();
            let req = self.build_read_req(
                path,
                offset,
                size,
                chunk_start,
                chunk_end,
                target,
                chunks,
                registrations.descriptor_for(target),
            );
            let policy = self.config.retry_policy();
            rpcs.spawn(async move {
                let service = endpoint.service;
                let result = call_with_retry(policy, || {
                    let req = req.clone();
                    let service = Arc::clone(&service);
                    async move { service.read(req).await }
                })
                .await;
                (target, result)
            });
        }

        let (err, total_io) = drain_data_rpcs(&mut rpcs).await;
        if err != ERRNO_OK {
            return Err(ClientError::Remote(err));
        }

        // Merge the pushed chunk ranges back into the caller's buffer.
        self.copy_back(
            path,
            buf,
            offset,
            chunk_start,
            chunk_end,
            &registrations,
        )?;
        Ok(total_io)
    }

    /// Forward a truncate to every daemon: each drops the chunks it owns
    /// past the new length.
    pub async fn truncate(&self, path: &str, length: u64) -> ClientResult<()> {
        let mut rpcs: JoinSet<(HostId, Result<i32, NetError>)> = JoinSet::new();
        for host in 0..self.directory.host_size() {
            let target = HostId(host);
            let endpoint = self.directory.endpoint(target)?.clone();
            let req = bbfs_proto::TruncateReq {
                path: path.to_string(),
                length,
            };
            let policy = self.config.retry_policy();
            rpcs.spawn(async move {
                let service = endpoint.service;
                let result = call_with_retry(policy, || {
                    let req = req.clone();
                    let service = Arc::clone(&service);
                    async move { Ok(service.truncate(req).await?.err) }
                })
                .await;
                (target, result)
            });
        }

        let mut err = ERRNO_OK;
        while let Some(joined) = rpcs.join_next().await {
            match joined {
                Ok((_, Ok(rsp_err))) => {
                    if rsp_err != ERRNO_OK && err == ERRNO_OK {
                        err = rsp_err;
                    }
                }
                Ok((target, Err(e))) => {
                    warn!(%target, error = %e, "truncate rpc failed");
                    if err == ERRNO_OK {
                        err = EBUSY;
                    }
                }
                Err(e) => {
                    error!(error = %e, "truncate rpc task failed");
                    if err == ERRNO_OK {
                        err = EBUSY;
                    }
                }
            }
        }
        if err != ERRNO_OK {
            return Err(ClientError::Remote(err));
        }
        Ok(())
    }

    /// Query every daemon's backing-store space and aggregate the counts.
    pub async fn chunk_stat(&self) -> ClientResult<ChunkStatRsp> {
        let mut rpcs: JoinSet<(HostId, Result<ChunkStatRsp, NetError>)> = JoinSet::new();
        for host in 0..self.directory.host_size() {
            let target = HostId(host);
            let endpoint = self.directory.endpoint(target)?.clone();
            let policy = self.config.retry_policy();
            rpcs.spawn(async move {
                let service = endpoint.service;
                let result = call_with_retry(policy, || {
                    let service = Arc::clone(&service);
                    async move { service.chunk_stat().await }
                })
                .await;
                (target, result)
            });
        }

        let mut aggregate = ChunkStatRsp::default();
        while let Some(joined) = rpcs.join_next().await {
            let (target, rsp) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "chunk stat rpc task failed");
                    return Err(ClientError::Remote(EBUSY));
                }
            };
            let rsp = rsp.map_err(ClientError::Transport)?;
            if rsp.err != ERRNO_OK {
                warn!(%target, errno = rsp.err, "chunk stat failed on daemon");
                return Err(ClientError::Remote(rsp.err));
            }
            if aggregate.chunk_size == 0 {
                aggregate.chunk_size = rsp.chunk_size;
            } else if aggregate.chunk_size != rsp.chunk_size {
                return Err(ClientError::ChunkSizeMismatch(
                    aggregate.chunk_size,
                    rsp.chunk_size,
                ));
            }
            aggregate.chunk_total += rsp.chunk_total;
            aggregate.chunk_free += rsp.chunk_free;
        }
        Ok(aggregate)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Group the operation's chunk range by owning daemon, in chunk order.
    fn bucketize(
        &self,
        path: &str,
        chunk_start: ChunkId,
        chunk_end: ChunkId,
    ) -> BTreeMap<HostId, Vec<ChunkId>> {
        let mut targets: BTreeMap<HostId, Vec<ChunkId>> = BTreeMap::new();
        for chunk_id in chunk_start..=chunk_end {
            targets
                .entry(self.distributor.locate_data(path, chunk_id))
                .or_default()
                .push(chunk_id);
        }
        targets
    }

    /// Register `buf` once per distinct transport endpoint among the
    /// targets, so each daemon gets a descriptor its own transport can
    /// resolve.
    fn register_targets(
        &self,
        targets: &BTreeMap<HostId, Vec<ChunkId>>,
        buf: &[u8],
        mode: BulkMode,
    ) -> ClientResult<TargetRegistrations> {
        let mut regs: Vec<(Arc<BulkRegistry>, BulkBuf)> = Vec::new();
        let mut by_target = HashMap::new();
        for &target in targets.keys() {
            let endpoint = self.directory.endpoint(target)?;
            let index = match regs
                .iter()
                .position(|(transport, _)| Arc::ptr_eq(transport, &endpoint.transport))
            {
                Some(index) => index,
                None => {
                    let registration = endpoint.transport.register(buf, mode);
                    regs.push((Arc::clone(&endpoint.transport), registration));
                    regs.len() - 1
                }
            };
            by_target.insert(target, index);
        }
        Ok(TargetRegistrations { regs, by_target })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_write_req(
        &self,
        path: &str,
        offset: u64,
        size: u64,
        chunk_start: ChunkId,
        chunk_end: ChunkId,
        target: HostId,
        chunks: &[ChunkId],
        bulk: BulkDescriptor,
    ) -> WriteChunkReq {
        let (total_chunk_size, wbitset) =
            self.per_target_layout(path, offset, size, chunk_start, chunk_end, target, chunks);
        WriteChunkReq {
            path: path.to_string(),
            offset: arith::chunk_lpad(offset, self.config.chunk_size),
            chunk_start,
            chunk_end,
            chunk_n: chunks.len() as u64,
            total_chunk_size,
            host_id: target,
            host_size: self.distributor.host_size(),
            bulk,
            wbitset,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_read_req(
        &self,
        path: &str,
        offset: u64,
        size: u64,
        chunk_start: ChunkId,
        chunk_end: ChunkId,
        target: HostId,
        chunks: &[ChunkId],
        bulk: BulkDescriptor,
    ) -> ReadChunkReq {
        let (total_chunk_size, wbitset) =
            self.per_target_layout(path, offset, size, chunk_start, chunk_end, target, chunks);
        ReadChunkReq {
            path: path.to_string(),
            offset: arith::chunk_lpad(offset, self.config.chunk_size),
            chunk_start,
            chunk_end,
            chunk_n: chunks.len() as u64,
            total_chunk_size,
            host_id: target,
            host_size: self.distributor.host_size(),
            bulk,
            wbitset,
        }
    }

    /// Per-target byte count and chunk bitmap.  The first and last spanned
    /// chunks are trimmed by the operation's left and right pads when this
    /// target owns them.
    #[allow(clippy::too_many_arguments)]
    fn per_target_layout(
        &self,
        path: &str,
        offset: u64,
        size: u64,
        chunk_start: ChunkId,
        chunk_end: ChunkId,
        target: HostId,
        chunks: &[ChunkId],
    ) -> (u64, Vec<u8>) {
        let chunksize = self.config.chunk_size;
        let mut total_chunk_size = chunks.len() as u64 * chunksize;
        if target == self.distributor.locate_data(path, chunk_start) {
            total_chunk_size -= arith::chunk_lpad(offset, chunksize);
        }
        if target == self.distributor.locate_data(path, chunk_end) {
            total_chunk_size -= arith::chunk_rpad(offset + size, chunksize);
        }

        let chunk_total = (chunk_end - chunk_start + 1) as usize;
        let mut wbitset = bitset_with_capacity(chunk_total);
        for &chunk_id in chunks {
            set_bit(&mut wbitset, (chunk_id - chunk_start) as usize);
        }
        (total_chunk_size, wbitset)
    }

    /// Copy each chunk's pushed range out of its owner's registration into
    /// the caller's buffer.  Unpushed ranges (holes, EOF) stay zero in the
    /// registration, so the caller observes zeros there.
    fn copy_back(
        &self,
        path: &str,
        buf: &mut [u8],
        offset: u64,
        chunk_start: ChunkId,
        chunk_end: ChunkId,
        registrations: &TargetRegistrations,
    ) -> ClientResult<()> {
        let chunksize = self.config.chunk_size;
        let size = buf.len() as u64;
        let lpad = arith::chunk_lpad(offset, chunksize);
        for chunk_id in chunk_start..=chunk_end {
            let (origin, len) = if chunk_id == chunk_start {
                (0, size.min(chunksize - lpad))
            } else {
                let origin = if lpad > 0 {
                    (chunksize - lpad) + (chunk_id - chunk_start - 1) * chunksize
                } else {
                    (chunk_id - chunk_start) * chunksize
                };
                (origin, chunksize.min(size - origin))
            };
            let target = self.distributor.locate_data(path, chunk_id);
            let registration = registrations.buf_for(target);
            registration
                .copy_out(origin, &mut buf[origin as usize..(origin + len) as usize])
                .map_err(ClientError::Transport)?;
        }
        Ok(())
    }
}

/// Drain every outstanding RPC, folding responses into a sticky errno and
/// an io-size total.  All wait handles are consumed even after a failure so
/// resources can be released.  A transport failure reads as `EBUSY`; a
/// daemon-reported errno is taken as-is.
async fn drain_data_rpcs(rpcs: &mut JoinSet<(HostId, Result<DataRsp, NetError>)>) -> (i32, u64) {
    let mut err = ERRNO_OK;
    let mut total_io = 0u64;
    while let Some(joined) = rpcs.join_next().await {
        match joined {
            Ok((target, Ok(rsp))) => {
                if rsp.err != ERRNO_OK {
                    warn!(%target, errno = rsp.err, "daemon reported i/o error");
                    if err == ERRNO_OK {
                        err = rsp.err;
                    }
                } else {
                    total_io += rsp.io_size;
                }
            }
            Ok((target, Err(e))) => {
                warn!(%target, error = %e, "data rpc failed");
                if err == ERRNO_OK {
                    err = EBUSY;
                }
            }
            Err(e) => {
                error!(error = %e, "data rpc task failed");
                if err == ERRNO_OK {
                    err = EBUSY;
                }
            }
        }
    }
    (err, total_io)
}
