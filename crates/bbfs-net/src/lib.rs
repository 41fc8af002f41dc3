//! Transport contract of the data plane.
//!
//! The data path only assumes two things of its transport: a single-sided
//! bulk-transfer primitive between registered buffers, and exactly-once RPC
//! delivery to an abstract daemon id.  This crate pins both contracts down
//! as Rust traits and provides the in-process realization used by the
//! loopback path and the test rigs.  A network transport (RDMA, TCP)
//! implements the same [`DataService`] trait on a proxy and the same
//! [`BulkRegistry`] semantics over registered memory.

pub mod bulk;
pub mod directory;
pub mod error;
pub mod rpc;
pub mod service;

pub use bulk::{BulkBuf, BulkDirection, BulkMode, BulkRegistry};
pub use directory::{Directory, Endpoint};
pub use error::NetError;
pub use rpc::{call_with_retry, RetryPolicy};
pub use service::DataService;
