//! Per-daemon data plane: the node-local chunk store, the tasklet layer
//! that overlaps disk I/O with bulk transfers, and the handlers for the
//! `write`, `read`, `truncate`, and `chunk_stat` RPCs.

pub mod chunk_storage;
pub mod context;
pub mod error;
pub mod ops;
pub mod service;
pub mod stats;

pub use chunk_storage::{ChunkStat, ChunkStorage};
pub use context::{DaemonConfig, DaemonContext};
pub use error::{StorageError, StorageResult};
pub use service::StorageService;
pub use stats::{SizeOp, Stats};
