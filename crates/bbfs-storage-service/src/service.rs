//! Handlers for the four data-plane RPCs.
//!
//! The write handler pulls each relevant chunk from the client's registered
//! buffer and immediately hands it to a write tasklet, so bulk transfer and
//! disk I/O overlap.  The read handler is symmetric: tasklets read from
//! disk first and each completed tasklet is pushed back to the client
//! without waiting for its siblings.  The response is not sent until every
//! tasklet of the RPC has completed.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, trace, warn};

use bbfs_net::{BulkDirection, BulkMode, DataService, NetError};
use bbfs_proto::bitset::get_bit;
use bbfs_proto::{ChunkStatRsp, DataRsp, ErrRsp, ReadChunkReq, TruncateReq, WriteChunkReq};
use bbfs_types::errno::{EAGAIN, EBUSY, EIO};

use crate::context::DaemonContext;
use crate::ops::{BulkPushArgs, ChunkReadOperation, ChunkTruncateOperation, ChunkWriteOperation};
use crate::stats::SizeOp;

/// Transfer coordinates of one chunk inside an operation.
struct ChunkTransfer {
    local_offset: u64,
    origin_offset: u64,
    size: u64,
}

/// The daemon-side implementation of [`DataService`].
pub struct StorageService {
    ctx: Arc<DaemonContext>,
}

impl StorageService {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<DaemonContext> {
        &self.ctx
    }

    /// Validate the request fields the offset arithmetic depends on.
    ///
    /// `offset` is the intra-chunk offset of the operation's *first* chunk;
    /// only that chunk may start past 0.  The walk below leans on this, so
    /// a request violating it is rejected the way an undecodable one is.
    fn check_request(
        &self,
        offset: u64,
        chunk_start: u64,
        chunk_end: u64,
        total_chunk_size: u64,
    ) -> bool {
        let chunksize = self.ctx.config().chunk_size;
        offset < chunksize
            && chunk_start <= chunk_end
            && total_chunk_size <= (chunk_end - chunk_start + 1).saturating_mul(chunksize)
    }
}

/// Offsets and size for the chunk at `chunk_id_file`, mirroring the walk
/// state: `chunk_size_left` bytes not yet assigned, `transfer_size` the
/// running per-chunk size (chunksize, clamped for the final chunk).
#[allow(clippy::too_many_arguments)]
fn chunk_transfer(
    chunksize: u64,
    offset: u64,
    bulk_size: u64,
    chunk_start: u64,
    chunk_id_file: u64,
    chunk_id_curr: u64,
    chunk_n: u64,
    total_chunk_size: u64,
    chunk_size_left: u64,
    transfer_size: &mut u64,
) -> ChunkTransfer {
    if chunk_id_file == chunk_start && offset > 0 {
        // The operation's first chunk with an intra-chunk offset.  A small
        // single-chunk operation transfers the whole registration.
        let size = if offset + bulk_size <= chunksize {
            bulk_size
        } else {
            chunksize - offset
        };
        ChunkTransfer {
            local_offset: 0,
            origin_offset: 0,
            size,
        }
    } else {
        let local_offset = total_chunk_size - chunk_size_left;
        // Only the operation's first chunk may carry an offset, so every
        // later chunk's position in the client buffer is fixed by it.
        let origin_offset = if offset > 0 {
            (chunksize - offset) + (chunk_id_file - chunk_start - 1) * chunksize
        } else {
            (chunk_id_file - chunk_start) * chunksize
        };
        if chunk_id_curr == chunk_n - 1 {
            *transfer_size = chunk_size_left;
        }
        ChunkTransfer {
            local_offset,
            origin_offset,
            size: *transfer_size,
        }
    }
}

#[async_trait]
impl DataService for StorageService {
    async fn write(&self, req: WriteChunkReq) -> Result<DataRsp, NetError> {
        let ctx = &self.ctx;
        let chunksize = ctx.config().chunk_size;
        let bulk_size = req.bulk.len;
        debug!(
            path = %req.path,
            chunk_start = req.chunk_start,
            chunk_end = req.chunk_end,
            chunk_n = req.chunk_n,
            total_chunk_size = req.total_chunk_size,
            bulk_size,
            offset = req.offset,
            "write rpc"
        );
        if !self.check_request(req.offset, req.chunk_start, req.chunk_end, req.total_chunk_size)
        {
            warn!(path = %req.path, "malformed write request");
            return Ok(DataRsp {
                err: EIO,
                io_size: 0,
            });
        }

        // Staging buffer for pull transfers; freed when the handler exits.
        let server_buf = ctx
            .transport()
            .create(req.total_chunk_size as usize, BulkMode::ReadWrite);

        let mut op = ChunkWriteOperation::new(
            req.path.clone(),
            Arc::clone(ctx.storage()),
            Arc::clone(ctx.limiter()),
        );
        let mut chunk_size_left = req.total_chunk_size;
        let mut chunk_id_curr: u64 = 0;
        let mut transfer_size = bulk_size.min(chunksize);

        for chunk_id_file in req.chunk_start..=req.chunk_end {
            if chunk_id_curr >= req.chunk_n {
                break;
            }
            if !get_bit(&req.wbitset, (chunk_id_file - req.chunk_start) as usize) {
                trace!(chunk_id_file, host_id = %req.host_id, "chunk not for this host");
                continue;
            }
            if ctx.config().enable_chunkstats {
                ctx.stats().add_write(&req.path, chunk_id_file);
            }
            let xfer = chunk_transfer(
                chunksize,
                req.offset,
                bulk_size,
                req.chunk_start,
                chunk_id_file,
                chunk_id_curr,
                req.chunk_n,
                req.total_chunk_size,
                chunk_size_left,
                &mut transfer_size,
            );
            trace!(
                chunk_id_file,
                local_offset = xfer.local_offset,
                origin_offset = xfer.origin_offset,
                size = xfer.size,
                "pull"
            );
            if let Err(e) = ctx.transport().transfer(
                BulkDirection::Pull,
                &req.bulk,
                xfer.origin_offset,
                &server_buf,
                xfer.local_offset,
                xfer.size,
            ) {
                warn!(path = %req.path, chunk_id_file, error = %e, "failed to pull chunk data from client");
                // No further tasklets; the submitted ones still run to
                // completion and are joined before responding.
                let _ = op.wait_for_tasks().await;
                return Ok(DataRsp {
                    err: EBUSY,
                    io_size: 0,
                });
            }
            let data = match server_buf.slice(xfer.local_offset, xfer.size) {
                Ok(data) => data,
                Err(e) => {
                    error!(error = %e, "failed to access staging buffer");
                    let _ = op.wait_for_tasks().await;
                    return Ok(DataRsp {
                        err: EIO,
                        io_size: 0,
                    });
                }
            };
            op.write_nonblock(
                chunk_id_file,
                data,
                if chunk_id_file == req.chunk_start {
                    req.offset
                } else {
                    0
                },
            );
            chunk_size_left -= xfer.size;
            chunk_id_curr += 1;
        }

        if chunk_size_left != 0 {
            warn!(
                path = %req.path,
                size_left = chunk_size_left,
                "not every byte of the request was matched to a chunk"
            );
        }

        let (err, io_size) = op.wait_for_tasks().await;
        if err == 0 && io_size != req.total_chunk_size {
            warn!(
                total_chunk_size = req.total_chunk_size,
                io_size, "write size mismatch"
            );
        }
        if ctx.config().enable_stats {
            ctx.stats().add_value_size(SizeOp::Write, bulk_size);
        }
        debug!(err, io_size, "write rpc done");
        Ok(DataRsp { err, io_size })
    }

    async fn read(&self, req: ReadChunkReq) -> Result<DataRsp, NetError> {
        let ctx = &self.ctx;
        let chunksize = ctx.config().chunk_size;
        let bulk_size = req.bulk.len;
        debug!(
            path = %req.path,
            chunk_start = req.chunk_start,
            chunk_end = req.chunk_end,
            chunk_n = req.chunk_n,
            total_chunk_size = req.total_chunk_size,
            bulk_size,
            offset = req.offset,
            "read rpc"
        );
        if !self.check_request(req.offset, req.chunk_start, req.chunk_end, req.total_chunk_size)
        {
            warn!(path = %req.path, "malformed read request");
            return Ok(DataRsp {
                err: EIO,
                io_size: 0,
            });
        }

        let server_buf = ctx
            .transport()
            .create(req.total_chunk_size as usize, BulkMode::ReadWrite);

        let mut op = ChunkReadOperation::new(
            req.path.clone(),
            Arc::clone(ctx.storage()),
            Arc::clone(ctx.limiter()),
        );
        let mut local_offsets = Vec::with_capacity(req.chunk_n as usize);
        let mut origin_offsets = Vec::with_capacity(req.chunk_n as usize);
        let mut chunk_size_left = req.total_chunk_size;
        let mut chunk_id_curr: u64 = 0;
        let mut transfer_size = bulk_size.min(chunksize);

        for chunk_id_file in req.chunk_start..=req.chunk_end {
            if chunk_id_curr >= req.chunk_n {
                break;
            }
            if !get_bit(&req.wbitset, (chunk_id_file - req.chunk_start) as usize) {
                trace!(chunk_id_file, host_id = %req.host_id, "chunk not for this host");
                continue;
            }
            if ctx.config().enable_chunkstats {
                ctx.stats().add_read(&req.path, chunk_id_file);
            }
            let xfer = chunk_transfer(
                chunksize,
                req.offset,
                bulk_size,
                req.chunk_start,
                chunk_id_file,
                chunk_id_curr,
                req.chunk_n,
                req.total_chunk_size,
                chunk_size_left,
                &mut transfer_size,
            );
            local_offsets.push(xfer.local_offset);
            origin_offsets.push(xfer.origin_offset);
            op.read_nonblock(
                chunk_id_file,
                xfer.size as usize,
                if chunk_id_file == req.chunk_start {
                    req.offset
                } else {
                    0
                },
            );
            chunk_size_left -= xfer.size;
            chunk_id_curr += 1;
        }

        if chunk_size_left == req.total_chunk_size {
            // Nothing matched this daemon; cancel instead of responding.
            warn!(path = %req.path, "read rpc matched no chunk on this host");
            return Err(NetError::Canceled);
        }
        if chunk_size_left != 0 {
            warn!(
                path = %req.path,
                size_left = chunk_size_left,
                "not every byte of the request was matched to a chunk"
            );
        }

        let args = BulkPushArgs {
            transport: ctx.transport(),
            client_bulk: req.bulk,
            server_buf: &server_buf,
            local_offsets,
            origin_offsets,
        };
        let (err, io_size) = op.wait_for_tasks_and_push_back(args).await;
        if ctx.config().enable_stats {
            ctx.stats().add_value_size(SizeOp::Read, bulk_size);
        }
        debug!(err, io_size, "read rpc done");
        Ok(DataRsp { err, io_size })
    }

    async fn truncate(&self, req: TruncateReq) -> Result<ErrRsp, NetError> {
        let ctx = &self.ctx;
        debug!(path = %req.path, length = req.length, "truncate rpc");

        let mut op = ChunkTruncateOperation::new(
            req.path.clone(),
            Arc::clone(ctx.storage()),
            Arc::clone(ctx.limiter()),
        );
        op.truncate(req.length);
        let err = op.wait_for_task().await;
        debug!(err, "truncate rpc done");
        Ok(ErrRsp { err })
    }

    async fn chunk_stat(&self) -> Result<ChunkStatRsp, NetError> {
        let storage = Arc::clone(self.ctx.storage());
        match tokio::task::spawn_blocking(move || storage.chunk_stat()).await {
            Ok(Ok(stat)) => Ok(ChunkStatRsp {
                err: 0,
                chunk_size: stat.chunk_size,
                chunk_total: stat.chunk_total,
                chunk_free: stat.chunk_free,
            }),
            Ok(Err(e)) => {
                warn!(error = %e, "chunk stat failed");
                Ok(ChunkStatRsp {
                    err: e.errno,
                    ..Default::default()
                })
            }
            Err(e) => {
                error!(error = %e, "chunk stat task failed");
                Ok(ChunkStatRsp {
                    err: EAGAIN,
                    ..Default::default()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbfs_net::BulkRegistry;
    use bbfs_proto::bitset::{bitset_with_capacity, set_bit};
    use bbfs_types::HostId;
    use std::path::Path;
    use tempfile::TempDir;

    use crate::context::DaemonConfig;

    const CS: u64 = 8;

    fn daemon(root: &Path, transport: &Arc<BulkRegistry>) -> StorageService {
        let config = DaemonConfig {
            root_path: root.to_path_buf(),
            chunk_size: CS,
            host_id: 0,
            host_size: 1,
            tasklet_workers: 4,
            enable_stats: true,
            enable_chunkstats: true,
        };
        let ctx = DaemonContext::new(config, Arc::clone(transport)).unwrap();
        StorageService::new(Arc::new(ctx))
    }

    fn all_chunks_bitset(chunk_n: usize) -> Vec<u8> {
        let mut bits = bitset_with_capacity(chunk_n);
        for i in 0..chunk_n {
            set_bit(&mut bits, i);
        }
        bits
    }

    #[tokio::test]
    async fn test_aligned_single_chunk_write() {
        let dir = TempDir::new().unwrap();
        let transport = BulkRegistry::new();
        let svc = daemon(dir.path(), &transport);

        let client = transport.register(b"ABCDEFGH", BulkMode::ReadOnly);
        let req = WriteChunkReq {
            path: "/a".into(),
            offset: 0,
            chunk_start: 0,
            chunk_end: 0,
            chunk_n: 1,
            total_chunk_size: 8,
            host_id: HostId(0),
            host_size: 1,
            bulk: client.descriptor(),
            wbitset: all_chunks_bitset(1),
        };
        let rsp = svc.write(req).await.unwrap();
        assert_eq!(rsp.err, 0);
        assert_eq!(rsp.io_size, 8);
        assert_eq!(
            std::fs::read(dir.path().join("a").join("0")).unwrap(),
            b"ABCDEFGH"
        );
    }

    #[tokio::test]
    async fn test_unaligned_write_spanning_two_chunks() {
        let dir = TempDir::new().unwrap();
        let transport = BulkRegistry::new();
        let svc = daemon(dir.path(), &transport);

        // 4 bytes at file offset 5: 3 bytes in chunk 0 (offset 5), 1 in
        // chunk 1 (offset 0).  One daemon owns both chunks here.
        let client = transport.register(b"WXYZ", BulkMode::ReadOnly);
        let req = WriteChunkReq {
            path: "/a".into(),
            offset: 5,
            chunk_start: 0,
            chunk_end: 1,
            chunk_n: 2,
            total_chunk_size: 4,
            host_id: HostId(0),
            host_size: 1,
            bulk: client.descriptor(),
            wbitset: all_chunks_bitset(2),
        };
        let rsp = svc.write(req).await.unwrap();
        assert_eq!(rsp.err, 0);
        assert_eq!(rsp.io_size, 4);

        let chunk0 = std::fs::read(dir.path().join("a").join("0")).unwrap();
        assert_eq!(chunk0.len(), 8);
        assert_eq!(&chunk0[5..], b"WXY");
        assert_eq!(
            std::fs::read(dir.path().join("a").join("1")).unwrap(),
            b"Z"
        );
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let transport = BulkRegistry::new();
        let svc = daemon(dir.path(), &transport);

        let payload: Vec<u8> = (0..24u8).collect();
        let client = transport.register(&payload, BulkMode::ReadOnly);
        let write_req = WriteChunkReq {
            path: "/rt".into(),
            offset: 0,
            chunk_start: 0,
            chunk_end: 2,
            chunk_n: 3,
            total_chunk_size: 24,
            host_id: HostId(0),
            host_size: 1,
            bulk: client.descriptor(),
            wbitset: all_chunks_bitset(3),
        };
        assert_eq!(svc.write(write_req).await.unwrap().err, 0);

        let read_target = transport.register(&[0u8; 24], BulkMode::WriteOnly);
        let read_req = ReadChunkReq {
            path: "/rt".into(),
            offset: 0,
            chunk_start: 0,
            chunk_end: 2,
            chunk_n: 3,
            total_chunk_size: 24,
            host_id: HostId(0),
            host_size: 1,
            bulk: read_target.descriptor(),
            wbitset: all_chunks_bitset(3),
        };
        let rsp = svc.read(read_req).await.unwrap();
        assert_eq!(rsp.err, 0);
        assert_eq!(rsp.io_size, 24);

        let mut out = vec![0u8; 24];
        read_target.copy_out(0, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_read_hole_counts_zero_bytes() {
        let dir = TempDir::new().unwrap();
        let transport = BulkRegistry::new();
        let svc = daemon(dir.path(), &transport);

        // Only chunk 1 exists; chunk 0 is a hole.
        let seed = transport.register(b"IJKLMNOP", BulkMode::ReadOnly);
        let seed_req = WriteChunkReq {
            path: "/holey".into(),
            offset: 0,
            chunk_start: 1,
            chunk_end: 1,
            chunk_n: 1,
            total_chunk_size: 8,
            host_id: HostId(0),
            host_size: 1,
            bulk: seed.descriptor(),
            wbitset: all_chunks_bitset(1),
        };
        assert_eq!(svc.write(seed_req).await.unwrap().err, 0);

        let read_target = transport.register(&[0u8; 16], BulkMode::WriteOnly);
        let read_req = ReadChunkReq {
            path: "/holey".into(),
            offset: 0,
            chunk_start: 0,
            chunk_end: 1,
            chunk_n: 2,
            total_chunk_size: 16,
            host_id: HostId(0),
            host_size: 1,
            bulk: read_target.descriptor(),
            wbitset: all_chunks_bitset(2),
        };
        let rsp = svc.read(read_req).await.unwrap();
        assert_eq!(rsp.err, 0);
        // Hole chunk contributes zero bytes.
        assert_eq!(rsp.io_size, 8);

        let mut out = vec![0u8; 16];
        read_target.copy_out(0, &mut out).unwrap();
        assert_eq!(&out[..8], &[0u8; 8]);
        assert_eq!(&out[8..], b"IJKLMNOP");
    }

    #[tokio::test]
    async fn test_read_with_no_matching_chunk_cancels() {
        let dir = TempDir::new().unwrap();
        let transport = BulkRegistry::new();
        let svc = daemon(dir.path(), &transport);

        let read_target = transport.register(&[0u8; 8], BulkMode::WriteOnly);
        let req = ReadChunkReq {
            path: "/none".into(),
            offset: 0,
            chunk_start: 0,
            chunk_end: 0,
            chunk_n: 1,
            total_chunk_size: 8,
            host_id: HostId(0),
            host_size: 1,
            bulk: read_target.descriptor(),
            wbitset: bitset_with_capacity(1),
        };
        let result = svc.read(req).await;
        assert!(matches!(result, Err(NetError::Canceled)));
    }

    #[tokio::test]
    async fn test_write_bulk_failure_is_ebusy() {
        let dir = TempDir::new().unwrap();
        let transport = BulkRegistry::new();
        let svc = daemon(dir.path(), &transport);

        let stale = {
            let client = transport.register(b"ABCDEFGH", BulkMode::ReadOnly);
            client.descriptor()
        };
        let req = WriteChunkReq {
            path: "/a".into(),
            offset: 0,
            chunk_start: 0,
            chunk_end: 0,
            chunk_n: 1,
            total_chunk_size: 8,
            host_id: HostId(0),
            host_size: 1,
            bulk: stale,
            wbitset: all_chunks_bitset(1),
        };
        let rsp = svc.write(req).await.unwrap();
        assert_eq!(rsp.err, EBUSY);
        assert_eq!(rsp.io_size, 0);
    }

    #[tokio::test]
    async fn test_malformed_request_is_eio() {
        let dir = TempDir::new().unwrap();
        let transport = BulkRegistry::new();
        let svc = daemon(dir.path(), &transport);

        let client = transport.register(b"ABCD", BulkMode::ReadOnly);
        let req = WriteChunkReq {
            path: "/a".into(),
            // Intra-chunk offset beyond the chunk size.
            offset: CS + 1,
            chunk_start: 0,
            chunk_end: 0,
            chunk_n: 1,
            total_chunk_size: 4,
            host_id: HostId(0),
            host_size: 1,
            bulk: client.descriptor(),
            wbitset: all_chunks_bitset(1),
        };
        let rsp = svc.write(req).await.unwrap();
        assert_eq!(rsp.err, EIO);
    }

    #[tokio::test]
    async fn test_truncate_rpc() {
        let dir = TempDir::new().unwrap();
        let transport = BulkRegistry::new();
        let svc = daemon(dir.path(), &transport);

        let payload: Vec<u8> = (0..24u8).collect();
        let client = transport.register(&payload, BulkMode::ReadOnly);
        let write_req = WriteChunkReq {
            path: "/t".into(),
            offset: 0,
            chunk_start: 0,
            chunk_end: 2,
            chunk_n: 3,
            total_chunk_size: 24,
            host_id: HostId(0),
            host_size: 1,
            bulk: client.descriptor(),
            wbitset: all_chunks_bitset(3),
        };
        assert_eq!(svc.write(write_req).await.unwrap().err, 0);

        let rsp = svc
            .truncate(TruncateReq {
                path: "/t".into(),
                length: 10,
            })
            .await
            .unwrap();
        assert_eq!(rsp.err, 0);

        assert!(dir.path().join("t").join("0").exists());
        assert_eq!(
            std::fs::metadata(dir.path().join("t").join("1")).unwrap().len(),
            2
        );
        assert!(!dir.path().join("t").join("2").exists());
    }

    #[tokio::test]
    async fn test_chunk_stat_rpc() {
        let dir = TempDir::new().unwrap();
        let transport = BulkRegistry::new();
        let svc = daemon(dir.path(), &transport);

        let rsp = svc.chunk_stat().await.unwrap();
        assert_eq!(rsp.err, 0);
        assert_eq!(rsp.chunk_size, CS);
        assert!(rsp.chunk_total > 0);
    }

    #[tokio::test]
    async fn test_stats_counters_bumped() {
        let dir = TempDir::new().unwrap();
        let transport = BulkRegistry::new();
        let svc = daemon(dir.path(), &transport);

        let client = transport.register(b"ABCDEFGH", BulkMode::ReadOnly);
        let req = WriteChunkReq {
            path: "/s".into(),
            offset: 0,
            chunk_start: 0,
            chunk_end: 0,
            chunk_n: 1,
            total_chunk_size: 8,
            host_id: HostId(0),
            host_size: 1,
            bulk: client.descriptor(),
            wbitset: all_chunks_bitset(1),
        };
        svc.write(req).await.unwrap();

        let stats = svc.context().stats();
        assert_eq!(stats.write_ops(), 1);
        assert_eq!(stats.chunk_write_count("/s", 0), 1);
        assert_eq!(stats.write_bytes(), 8);
    }
}
