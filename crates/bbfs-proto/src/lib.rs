//! Wire-level request/response types for the four data-plane RPCs.

pub mod bitset;
pub mod messages;

pub use bitset::{bitset_with_capacity, get_bit, set_bit};
pub use messages::{
    BulkDescriptor, ChunkStatRsp, DataRsp, ErrRsp, ReadChunkReq, TruncateReq, WriteChunkReq,
};
