//! Shared identifier and errno types for the bbfs data plane.

pub mod errno;
pub mod ids;

pub use errno::{errno_of, ERRNO_OK};
pub use ids::{ChunkId, HostId};
