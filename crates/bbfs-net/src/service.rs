use async_trait::async_trait;

use bbfs_proto::{ChunkStatRsp, DataRsp, ErrRsp, ReadChunkReq, TruncateReq, WriteChunkReq};

use crate::error::NetError;

/// The four data-plane RPCs a daemon serves.
///
/// Implemented directly by the daemon's handler for the in-process path and
/// by transport proxies for networked deployments.  Disk-level failures are
/// reported inside the response's `err` field; an `Err(NetError)` means the
/// transport itself failed (or, for reads, that the server canceled because
/// no chunk of the request matched it).
///
/// The transport behind this trait must deliver each call exactly once or
/// surface a retryable error; duplicated delivery is not expected.
#[async_trait]
pub trait DataService: Send + Sync {
    async fn write(&self, req: WriteChunkReq) -> Result<DataRsp, NetError>;

    async fn read(&self, req: ReadChunkReq) -> Result<DataRsp, NetError>;

    async fn truncate(&self, req: TruncateReq) -> Result<ErrRsp, NetError>;

    async fn chunk_stat(&self) -> Result<ChunkStatRsp, NetError>;
}
