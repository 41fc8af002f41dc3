//! Chunk arithmetic, hashing, and data placement shared by the client and
//! the daemons.

pub mod arith;
pub mod distributor;
pub mod murmur3;

pub use distributor::{Distributor, SimpleHashDistributor};
