//! Request and response structs for `write`, `read`, `truncate`, and
//! `chunk_stat`.

use bbfs_types::{ChunkId, HostId};
use serde::{Deserialize, Serialize};

/// Handle to a bulk-registered buffer, resolvable by the receiving
/// transport.  `len` is the registered length in bytes; servers read it as
/// the operation's `bulk_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BulkDescriptor {
    pub id: u64,
    pub len: u64,
}

/// Write request sent to one daemon.
///
/// `offset` is the intra-chunk offset of the operation's first chunk
/// (`file_offset % chunk_size`), not a file offset.  Only the chunk with id
/// `chunk_start` may carry a nonzero offset; every other chunk starts at 0.
/// `wbitset` bit `i` is set iff chunk `chunk_start + i` hashes to the
/// receiving daemon.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteChunkReq {
    pub path: String,
    pub offset: u64,
    pub chunk_start: ChunkId,
    pub chunk_end: ChunkId,
    /// Number of chunks of the operation serviced by the receiving daemon.
    pub chunk_n: u64,
    /// Payload bytes serviced by the receiving daemon.
    pub total_chunk_size: u64,
    pub host_id: HostId,
    pub host_size: u32,
    pub bulk: BulkDescriptor,
    pub wbitset: Vec<u8>,
}

/// Read request sent to one daemon.  Field meanings match [`WriteChunkReq`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadChunkReq {
    pub path: String,
    pub offset: u64,
    pub chunk_start: ChunkId,
    pub chunk_end: ChunkId,
    pub chunk_n: u64,
    pub total_chunk_size: u64,
    pub host_id: HostId,
    pub host_size: u32,
    pub bulk: BulkDescriptor,
    pub wbitset: Vec<u8>,
}

/// Response to a write or read: errno (0 on success) plus the bytes moved
/// to/from the backing store.  A short read at EOF reports `err == 0` with
/// `io_size` below the requested total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DataRsp {
    pub err: i32,
    pub io_size: u64,
}

/// Truncate request: drop every chunk past the new length and cut the new
/// tail chunk down.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TruncateReq {
    pub path: String,
    pub length: u64,
}

/// Errno-only response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrRsp {
    pub err: i32,
}

/// Space information of one daemon's backing store, in chunk units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkStatRsp {
    pub err: i32,
    pub chunk_size: u64,
    pub chunk_total: u64,
    pub chunk_free: u64,
}
