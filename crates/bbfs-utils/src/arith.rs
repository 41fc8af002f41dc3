//! Chunk-range arithmetic.
//!
//! All byte/chunk conversions used by the dispatcher and the handlers live
//! here so the two sides agree on every boundary case.

use bbfs_types::ChunkId;

/// Id of the chunk holding the byte at `offset`.
#[inline]
pub fn chunk_id_for_offset(offset: u64, chunk_size: u64) -> ChunkId {
    offset / chunk_size
}

/// Number of chunks spanned by an operation of `count` bytes at `offset`.
///
/// A zero-byte operation spans no chunks.
pub fn chunk_count_for_operation(offset: u64, count: u64, chunk_size: u64) -> u64 {
    if count == 0 {
        return 0;
    }
    chunk_id_for_offset(offset + count - 1, chunk_size) - chunk_id_for_offset(offset, chunk_size)
        + 1
}

/// Bytes of the first spanned chunk that lie before `offset` (the left pad).
#[inline]
pub fn chunk_lpad(offset: u64, chunk_size: u64) -> u64 {
    offset % chunk_size
}

/// Bytes of the last spanned chunk that lie at or after `end` (the right
/// pad).  Zero when `end` falls exactly on a chunk boundary.
#[inline]
pub fn chunk_rpad(end: u64, chunk_size: u64) -> u64 {
    (chunk_size - end % chunk_size) % chunk_size
}

/// Whether `offset` falls exactly on a chunk boundary.
#[inline]
pub fn is_chunk_aligned(offset: u64, chunk_size: u64) -> bool {
    offset % chunk_size == 0
}
