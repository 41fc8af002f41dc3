//! Tasklet layer: non-blocking chunk I/O operations.
//!
//! Each RPC builds one operation object, submits a tasklet per chunk, and
//! joins them before responding.  Submission is cheap and non-blocking: the
//! synchronous disk call runs on the blocking pool, bounded by the daemon's
//! tasklet semaphore so a burst of RPCs cannot starve the runtime.  Once
//! submitted, a tasklet runs to completion; a failing tasklet never cancels
//! its siblings.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, warn};

use bbfs_net::{BulkBuf, BulkDirection, BulkRegistry};
use bbfs_proto::BulkDescriptor;
use bbfs_types::errno::{EBUSY, EIO, ERRNO_OK};
use bbfs_types::ChunkId;

use crate::chunk_storage::ChunkStorage;

/// Result slot of one tasklet.
struct TaskResult {
    errno: i32,
    io_size: u64,
}

/// Fold one tasklet outcome into the operation's aggregate: the first
/// failure's errno wins, successful io sizes add up.
fn fold(err: &mut i32, io: &mut u64, res: &TaskResult) {
    if res.errno != ERRNO_OK {
        if *err == ERRNO_OK {
            *err = res.errno;
        }
    } else {
        *io += res.io_size;
    }
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

/// Chunk-write tasklets of one write RPC.
pub struct ChunkWriteOperation {
    path: String,
    storage: Arc<ChunkStorage>,
    limiter: Arc<Semaphore>,
    tasks: Vec<JoinHandle<TaskResult>>,
}

impl ChunkWriteOperation {
    pub fn new(path: impl Into<String>, storage: Arc<ChunkStorage>, limiter: Arc<Semaphore>) -> Self {
        Self {
            path: path.into(),
            storage,
            limiter,
            tasks: Vec::new(),
        }
    }

    /// Submit a tasklet writing `data` to chunk `chunk_id` at the given
    /// intra-chunk offset.  Returns immediately.
    pub fn write_nonblock(&mut self, chunk_id: ChunkId, data: Bytes, offset: u64) {
        let path = self.path.clone();
        let storage = Arc::clone(&self.storage);
        let limiter = Arc::clone(&self.limiter);
        self.tasks.push(tokio::spawn(async move {
            let _permit = match limiter.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return TaskResult { errno: EIO, io_size: 0 },
            };
            let joined = tokio::task::spawn_blocking(move || {
                match storage.write_chunk(&path, chunk_id, &data, offset) {
                    Ok(n) => TaskResult {
                        errno: ERRNO_OK,
                        io_size: n,
                    },
                    Err(e) => {
                        warn!(chunk_id, error = %e, "chunk write tasklet failed");
                        TaskResult {
                            errno: e.errno,
                            io_size: 0,
                        }
                    }
                }
            })
            .await;
            joined.unwrap_or_else(|e| {
                error!(chunk_id, error = %e, "chunk write tasklet panicked");
                TaskResult {
                    errno: EIO,
                    io_size: 0,
                }
            })
        }));
    }

    /// Join every submitted tasklet.  Returns `(errno, total_io_size)`:
    /// errno of the first observed failure (0 if all succeeded) and the sum
    /// of bytes written by the successful tasklets.
    pub async fn wait_for_tasks(self) -> (i32, u64) {
        let mut err = ERRNO_OK;
        let mut io = 0u64;
        for task in self.tasks {
            match task.await {
                Ok(res) => fold(&mut err, &mut io, &res),
                Err(e) => {
                    error!(error = %e, "write tasklet join failed");
                    if err == ERRNO_OK {
                        err = EIO;
                    }
                }
            }
        }
        (err, io)
    }

    /// Number of tasklets submitted so far.
    pub fn submitted(&self) -> usize {
        self.tasks.len()
    }
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// Transfer coordinates for pushing completed read tasklets back to the
/// client.  Indexed by submission order.
pub struct BulkPushArgs<'a> {
    pub transport: &'a BulkRegistry,
    pub client_bulk: BulkDescriptor,
    pub server_buf: &'a BulkBuf,
    pub local_offsets: Vec<u64>,
    pub origin_offsets: Vec<u64>,
}

/// Chunk-read tasklets of one read RPC.
pub struct ChunkReadOperation {
    path: String,
    storage: Arc<ChunkStorage>,
    limiter: Arc<Semaphore>,
    tasks: JoinSet<(usize, TaskResult, Vec<u8>)>,
    submitted: usize,
}

impl ChunkReadOperation {
    pub fn new(path: impl Into<String>, storage: Arc<ChunkStorage>, limiter: Arc<Semaphore>) -> Self {
        Self {
            path: path.into(),
            storage,
            limiter,
            tasks: JoinSet::new(),
            submitted: 0,
        }
    }

    /// Submit a tasklet reading `size` bytes of chunk `chunk_id` at the
    /// given intra-chunk offset.  Returns immediately.
    pub fn read_nonblock(&mut self, chunk_id: ChunkId, size: usize, offset: u64) {
        let index = self.submitted;
        self.submitted += 1;
        let path = self.path.clone();
        let storage = Arc::clone(&self.storage);
        let limiter = Arc::clone(&self.limiter);
        self.tasks.spawn(async move {
            let _permit = match limiter.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return (
                        index,
                        TaskResult {
                            errno: EIO,
                            io_size: 0,
                        },
                        Vec::new(),
                    )
                }
            };
            let joined = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; size];
                match storage.read_chunk(&path, chunk_id, &mut buf, offset) {
                    Ok(n) => {
                        buf.truncate(n as usize);
                        (
                            TaskResult {
                                errno: ERRNO_OK,
                                io_size: n,
                            },
                            buf,
                        )
                    }
                    Err(e) => {
                        warn!(chunk_id, error = %e, "chunk read tasklet failed");
                        (
                            TaskResult {
                                errno: e.errno,
                                io_size: 0,
                            },
                            Vec::new(),
                        )
                    }
                }
            })
            .await;
            match joined {
                Ok((res, buf)) => (index, res, buf),
                Err(e) => {
                    error!(chunk_id, error = %e, "chunk read tasklet panicked");
                    (
                        index,
                        TaskResult {
                            errno: EIO,
                            io_size: 0,
                        },
                        Vec::new(),
                    )
                }
            }
        });
    }

    /// Number of tasklets submitted so far.
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Join the read tasklets; as each completes, land its bytes in the
    /// server buffer and push them to the client's registered buffer without
    /// waiting for siblings.  Returns `(errno, total_pushed)`.
    ///
    /// A tasklet that read zero bytes hit a hole (or EOF) and pushes
    /// nothing; that is not an error.  A failed push surfaces as `EBUSY`.
    pub async fn wait_for_tasks_and_push_back(mut self, args: BulkPushArgs<'_>) -> (i32, u64) {
        let mut err = ERRNO_OK;
        let mut io = 0u64;
        while let Some(joined) = self.tasks.join_next().await {
            let (index, res, data) = match joined {
                Ok(task) => task,
                Err(e) => {
                    error!(error = %e, "read tasklet join failed");
                    if err == ERRNO_OK {
                        err = EIO;
                    }
                    continue;
                }
            };
            if res.errno != ERRNO_OK {
                if err == ERRNO_OK {
                    err = res.errno;
                }
                continue;
            }
            if res.io_size == 0 {
                continue;
            }

            let local_offset = args.local_offsets[index];
            let origin_offset = args.origin_offsets[index];
            let push = args
                .server_buf
                .write_at(local_offset, &data)
                .and_then(|_| {
                    args.transport.transfer(
                        BulkDirection::Push,
                        &args.client_bulk,
                        origin_offset,
                        args.server_buf,
                        local_offset,
                        res.io_size,
                    )
                });
            match push {
                Ok(()) => io += res.io_size,
                Err(e) => {
                    warn!(chunk_index = index, error = %e, "failed to push read data back to client");
                    if err == ERRNO_OK {
                        err = EBUSY;
                    }
                }
            }
        }
        (err, io)
    }
}

// ---------------------------------------------------------------------------
// Truncate
// ---------------------------------------------------------------------------

/// Single-tasklet truncate of one file's chunks on this daemon.
pub struct ChunkTruncateOperation {
    path: String,
    storage: Arc<ChunkStorage>,
    limiter: Arc<Semaphore>,
    task: Option<JoinHandle<i32>>,
}

impl ChunkTruncateOperation {
    pub fn new(path: impl Into<String>, storage: Arc<ChunkStorage>, limiter: Arc<Semaphore>) -> Self {
        Self {
            path: path.into(),
            storage,
            limiter,
            task: None,
        }
    }

    /// Submit the truncate tasklet: remove every chunk past the new file
    /// length, then cut the new tail chunk down to the remainder.
    ///
    /// Concurrent writers are not serialized against truncation; callers
    /// must stop modifying the file while a truncate is in flight.
    pub fn truncate(&mut self, length: u64) {
        let path = self.path.clone();
        let storage = Arc::clone(&self.storage);
        let limiter = Arc::clone(&self.limiter);
        self.task = Some(tokio::spawn(async move {
            let _permit = match limiter.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return EIO,
            };
            let joined = tokio::task::spawn_blocking(move || {
                let chunksize = storage.chunksize();
                let chunk_start = length.div_ceil(chunksize);
                if let Err(e) = storage.trim_chunk_space(&path, chunk_start) {
                    warn!(path = %path, error = %e, "trim failed during truncate");
                    return e.errno;
                }
                let tail = length % chunksize;
                if tail != 0 {
                    if let Err(e) = storage.truncate_chunk_file(&path, chunk_start - 1, tail) {
                        warn!(path = %path, error = %e, "tail chunk truncate failed");
                        return e.errno;
                    }
                }
                ERRNO_OK
            })
            .await;
            joined.unwrap_or_else(|e| {
                error!(error = %e, "truncate tasklet panicked");
                EIO
            })
        }));
    }

    /// Join the truncate tasklet and return its errno (0 on success).
    pub async fn wait_for_task(self) -> i32 {
        match self.task {
            Some(task) => match task.await {
                Ok(errno) => errno,
                Err(e) => {
                    error!(error = %e, "truncate tasklet join failed");
                    EIO
                }
            },
            None => {
                error!("truncate awaited before submission");
                EIO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbfs_net::BulkMode;
    use bbfs_types::errno::ENOENT;
    use tempfile::TempDir;

    const CS: u64 = 8;

    fn rig() -> (TempDir, Arc<ChunkStorage>, Arc<Semaphore>) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(ChunkStorage::new(dir.path(), CS).unwrap());
        (dir, storage, Arc::new(Semaphore::new(4)))
    }

    #[tokio::test]
    async fn test_write_operation_all_succeed() {
        let (_dir, storage, limiter) = rig();
        let mut op = ChunkWriteOperation::new("/f", Arc::clone(&storage), limiter);
        op.write_nonblock(0, Bytes::from_static(b"ABCDEFGH"), 0);
        op.write_nonblock(1, Bytes::from_static(b"IJKL"), 0);
        assert_eq!(op.submitted(), 2);

        let (err, io) = op.wait_for_tasks().await;
        assert_eq!(err, 0);
        assert_eq!(io, 12);

        let mut buf = [0u8; 4];
        storage.read_chunk("/f", 1, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"IJKL");
    }

    #[tokio::test]
    async fn test_write_operation_reports_first_error_and_partial_io() {
        let (dir, storage, limiter) = rig();
        // Make chunk 1's file unwritable: a directory where the chunk file
        // should be makes the open fail while chunk 0 still succeeds.
        std::fs::create_dir_all(dir.path().join("f").join("1")).unwrap();

        let mut op = ChunkWriteOperation::new("/f", storage, limiter);
        op.write_nonblock(0, Bytes::from_static(b"ABCD"), 0);
        op.write_nonblock(1, Bytes::from_static(b"EFGH"), 0);

        let (err, io) = op.wait_for_tasks().await;
        assert_ne!(err, 0);
        assert_eq!(io, 4);
    }

    #[tokio::test]
    async fn test_read_operation_pushes_back() {
        let (_dir, storage, limiter) = rig();
        storage.write_chunk("/f", 0, b"ABCDEFGH", 0).unwrap();
        storage.write_chunk("/f", 1, b"IJKL", 0).unwrap();

        let registry = BulkRegistry::new();
        let client = registry.register(&[0u8; 12], BulkMode::WriteOnly);
        let server_buf = registry.create(12, BulkMode::ReadWrite);

        let mut op = ChunkReadOperation::new("/f", storage, limiter);
        op.read_nonblock(0, 8, 0);
        op.read_nonblock(1, 4, 0);

        let args = BulkPushArgs {
            transport: &registry,
            client_bulk: client.descriptor(),
            server_buf: &server_buf,
            local_offsets: vec![0, 8],
            origin_offsets: vec![0, 8],
        };
        let (err, io) = op.wait_for_tasks_and_push_back(args).await;
        assert_eq!(err, 0);
        assert_eq!(io, 12);

        let mut out = [0u8; 12];
        client.copy_out(0, &mut out).unwrap();
        assert_eq!(&out, b"ABCDEFGHIJKL");
    }

    #[tokio::test]
    async fn test_read_operation_hole_pushes_nothing() {
        let (_dir, storage, limiter) = rig();
        storage.write_chunk("/f", 1, b"IJKL", 0).unwrap();

        let registry = BulkRegistry::new();
        let client = registry.register(&[0u8; 12], BulkMode::WriteOnly);
        let server_buf = registry.create(12, BulkMode::ReadWrite);

        let mut op = ChunkReadOperation::new("/f", storage, limiter);
        op.read_nonblock(0, 8, 0); // hole
        op.read_nonblock(1, 4, 0);

        let args = BulkPushArgs {
            transport: &registry,
            client_bulk: client.descriptor(),
            server_buf: &server_buf,
            local_offsets: vec![0, 8],
            origin_offsets: vec![0, 8],
        };
        let (err, io) = op.wait_for_tasks_and_push_back(args).await;
        assert_eq!(err, 0);
        assert_eq!(io, 4);

        let mut out = [0u8; 12];
        client.copy_out(0, &mut out).unwrap();
        assert_eq!(&out[..8], &[0; 8]);
        assert_eq!(&out[8..], b"IJKL");
    }

    #[tokio::test]
    async fn test_read_push_failure_is_ebusy() {
        let (_dir, storage, limiter) = rig();
        storage.write_chunk("/f", 0, b"ABCD", 0).unwrap();

        let registry = BulkRegistry::new();
        let server_buf = registry.create(4, BulkMode::ReadWrite);
        // Descriptor of an already-dropped registration.
        let stale = {
            let client = registry.register(&[0u8; 4], BulkMode::WriteOnly);
            client.descriptor()
        };

        let mut op = ChunkReadOperation::new("/f", storage, limiter);
        op.read_nonblock(0, 4, 0);

        let args = BulkPushArgs {
            transport: &registry,
            client_bulk: stale,
            server_buf: &server_buf,
            local_offsets: vec![0],
            origin_offsets: vec![0],
        };
        let (err, io) = op.wait_for_tasks_and_push_back(args).await;
        assert_eq!(err, EBUSY);
        assert_eq!(io, 0);
    }

    #[tokio::test]
    async fn test_truncate_operation() {
        let (_dir, storage, limiter) = rig();
        for id in 0..3 {
            storage.write_chunk("/f", id, b"ABCDEFGH", 0).unwrap();
        }

        // New length 10: chunk 2 removed, chunk 1 cut to 2 bytes.
        let mut op = ChunkTruncateOperation::new("/f", Arc::clone(&storage), limiter);
        op.truncate(10);
        assert_eq!(op.wait_for_task().await, 0);

        let mut buf = [0u8; 8];
        assert_eq!(storage.read_chunk("/f", 0, &mut buf, 0).unwrap(), 8);
        assert_eq!(storage.read_chunk("/f", 1, &mut buf, 0).unwrap(), 2);
        assert_eq!(storage.read_chunk("/f", 2, &mut buf, 0).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_truncate_to_zero_removes_everything() {
        let (dir, storage, limiter) = rig();
        for id in 0..3 {
            storage.write_chunk("/f", id, b"ABCDEFGH", 0).unwrap();
        }
        let mut op = ChunkTruncateOperation::new("/f", Arc::clone(&storage), limiter);
        op.truncate(0);
        assert_eq!(op.wait_for_task().await, 0);
        assert_eq!(std::fs::read_dir(dir.path().join("f")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_truncate_missing_tail_chunk_reports_enoent() {
        let (_dir, storage, limiter) = rig();
        storage.write_chunk("/f", 0, b"ABCDEFGH", 0).unwrap();
        // Tail chunk 1 was never written; cutting it cannot succeed.
        let mut op = ChunkTruncateOperation::new("/f", storage, limiter);
        op.truncate(10);
        assert_eq!(op.wait_for_task().await, ENOENT);
    }
}
