//! Node-local chunk store.
//!
//! Every file of the namespace is one flat directory under `root_path`; no
//! directory hierarchy is mirrored on the backing store.  The directory name
//! is the file path with its leading `/` stripped and every remaining `/`
//! replaced by `:`, so `/bench/out.dat` lands in
//! `<root>/bench:out.dat/`.  Each chunk is its own regular file inside that
//! directory, named by its decimal chunk id.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::PathBuf;

use nix::sys::statvfs;
use nix::unistd::{access, AccessFlags};
use tracing::{debug, warn};

use bbfs_types::errno::{EINVAL, EIO};
use bbfs_types::ChunkId;

use crate::error::{StorageError, StorageResult};

/// Space information of the backing file system, in chunk units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStat {
    pub chunk_size: u64,
    pub chunk_total: u64,
    pub chunk_free: u64,
}

/// Persistent chunk store rooted at one directory of the node-local FS.
///
/// The store is only ever mutated by the owning daemon.  Concurrent writes
/// to the same chunk file are not serialized here; positional writes give
/// last-writer-wins per call and overlapping writers must be serialized by
/// the application.  The same holds for `trim_chunk_space` racing writers.
#[derive(Debug)]
pub struct ChunkStorage {
    root_path: PathBuf,
    chunksize: u64,
}

/// EINTR and EAGAIN/EWOULDBLOCK are retried; everything else surfaces.
fn retryable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock
    )
}

impl ChunkStorage {
    /// Open a chunk store rooted at `root_path`.
    ///
    /// The root must be an absolute path to an existing directory the
    /// daemon can read, write, and traverse; otherwise the daemon must not
    /// start, so this fails rather than degrade.
    pub fn new(root_path: impl Into<PathBuf>, chunksize: u64) -> StorageResult<Self> {
        let root_path = root_path.into();
        if !root_path.is_absolute() {
            return Err(StorageError::new(
                EINVAL,
                format!("chunk root '{}' is not absolute", root_path.display()),
            ));
        }
        if chunksize == 0 {
            return Err(StorageError::new(EINVAL, "chunksize must be positive"));
        }
        access(
            &root_path,
            AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK,
        )
        .map_err(|e| {
            StorageError::new(
                e as i32,
                format!(
                    "insufficient permissions on chunk root '{}'",
                    root_path.display()
                ),
            )
        })?;
        debug!(root = %root_path.display(), chunksize, "chunk storage initialized");
        Ok(Self {
            root_path,
            chunksize,
        })
    }

    pub fn chunksize(&self) -> u64 {
        self.chunksize
    }

    /// Backing-store directory name for a file: leading `/` stripped,
    /// inner `/` replaced by `:`.
    fn chunks_dir(file_path: &str) -> String {
        debug_assert!(file_path.starts_with('/'), "file paths are absolute");
        file_path
            .strip_prefix('/')
            .unwrap_or(file_path)
            .replace('/', ":")
    }

    fn chunk_dir_path(&self, file_path: &str) -> PathBuf {
        self.root_path.join(Self::chunks_dir(file_path))
    }

    fn chunk_file_path(&self, file_path: &str, chunk_id: ChunkId) -> PathBuf {
        self.chunk_dir_path(file_path).join(chunk_id.to_string())
    }

    /// Create the file's chunk directory if it does not exist yet.
    fn init_chunk_space(&self, file_path: &str) -> StorageResult<()> {
        let dir = self.chunk_dir_path(file_path);
        let mut builder = DirBuilder::new();
        builder.mode(0o750);
        match builder.create(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(StorageError::from_io(
                format!("failed to create chunk directory '{}'", dir.display()),
                &e,
            )),
        }
    }

    fn check_intra_chunk_range(&self, size: usize, offset: u64) -> StorageResult<()> {
        if size as u64 > self.chunksize || offset > self.chunksize - size as u64 {
            return Err(StorageError::new(
                EINVAL,
                format!(
                    "range of {} bytes at intra-chunk offset {} exceeds chunksize {}",
                    size, offset, self.chunksize
                ),
            ));
        }
        Ok(())
    }

    /// Write `buf` into the chunk file at `offset` (an intra-chunk offset).
    ///
    /// Creates the chunk directory and file lazily.  Positional writes are
    /// retried on interruption until the full request is on disk, so a
    /// success always reports exactly `buf.len()` bytes.
    pub fn write_chunk(
        &self,
        file_path: &str,
        chunk_id: ChunkId,
        buf: &[u8],
        offset: u64,
    ) -> StorageResult<u64> {
        self.check_intra_chunk_range(buf.len(), offset)?;
        self.init_chunk_space(file_path)?;

        let path = self.chunk_file_path(file_path, chunk_id);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o640)
            .open(&path)
            .map_err(|e| {
                StorageError::from_io(
                    format!("failed to open chunk file '{}' for write", path.display()),
                    &e,
                )
            })?;

        let mut wrote_total = 0usize;
        while wrote_total != buf.len() {
            match file.write_at(&buf[wrote_total..], offset + wrote_total as u64) {
                Ok(n) => wrote_total += n,
                Err(e) if retryable(&e) => continue,
                Err(e) => {
                    return Err(StorageError::from_io(
                        format!(
                            "failed to write chunk file '{}' (size {}, offset {})",
                            path.display(),
                            buf.len(),
                            offset
                        ),
                        &e,
                    ))
                }
            }
        }
        Ok(wrote_total as u64)
    }

    /// Read up to `buf.len()` bytes from the chunk file at `offset`.
    ///
    /// A missing chunk file is a hole and reads as zero bytes.  Hitting EOF
    /// before the buffer is full is not an error; the short count is
    /// returned.
    pub fn read_chunk(
        &self,
        file_path: &str,
        chunk_id: ChunkId,
        buf: &mut [u8],
        offset: u64,
    ) -> StorageResult<u64> {
        self.check_intra_chunk_range(buf.len(), offset)?;

        let path = self.chunk_file_path(file_path, chunk_id);
        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(StorageError::from_io(
                    format!("failed to open chunk file '{}' for read", path.display()),
                    &e,
                ))
            }
        };

        let mut read_total = 0usize;
        while read_total != buf.len() {
            match file.read_at(&mut buf[read_total..], offset + read_total as u64) {
                // EOF before the buffer is full: return the short count.
                Ok(0) => break,
                Ok(n) => read_total += n,
                Err(e) if retryable(&e) => continue,
                Err(e) => {
                    return Err(StorageError::from_io(
                        format!(
                            "failed to read chunk file '{}' (size {}, offset {})",
                            path.display(),
                            buf.len(),
                            offset
                        ),
                        &e,
                    ))
                }
            }
        }
        Ok(read_total as u64)
    }

    /// Truncate one chunk file to `length`, with `0 < length <= chunksize`.
    pub fn truncate_chunk_file(
        &self,
        file_path: &str,
        chunk_id: ChunkId,
        length: u64,
    ) -> StorageResult<()> {
        if length == 0 || length > self.chunksize {
            return Err(StorageError::new(
                EINVAL,
                format!(
                    "truncate length {} outside (0, {}]",
                    length, self.chunksize
                ),
            ));
        }
        let path = self.chunk_file_path(file_path, chunk_id);
        nix::unistd::truncate(&path, length as i64).map_err(|e| {
            StorageError::new(
                e as i32,
                format!(
                    "failed to truncate chunk file '{}' to {} bytes",
                    path.display(),
                    length
                ),
            )
        })
    }

    /// Remove every chunk file of `file_path` with id >= `chunk_start`.
    ///
    /// Missing files (and a missing chunk directory) are not errors.  If a
    /// removal fails for another reason the remaining files are still
    /// attempted and a single aggregated error is raised afterwards.
    pub fn trim_chunk_space(&self, file_path: &str, chunk_start: ChunkId) -> StorageResult<()> {
        let dir = self.chunk_dir_path(file_path);
        let entries = match fs::read_dir(&dir) {
            Ok(it) => it,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StorageError::from_io(
                    format!("failed to list chunk directory '{}'", dir.display()),
                    &e,
                ))
            }
        };

        let mut failed = false;
        for entry in entries {
            let entry = match entry {
                Ok(en) => en,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "failed to iterate chunk directory");
                    failed = true;
                    continue;
                }
            };
            let name = entry.file_name();
            let chunk_id: ChunkId = match name.to_string_lossy().parse() {
                Ok(id) => id,
                Err(_) => {
                    warn!(entry = ?name, "unexpected entry in chunk directory");
                    continue;
                }
            };
            if chunk_id < chunk_start {
                continue;
            }
            if let Err(e) = fs::remove_file(entry.path()) {
                if e.kind() != ErrorKind::NotFound {
                    failed = true;
                    warn!(path = %entry.path().display(), error = %e, "failed to remove chunk file");
                }
            }
        }
        if failed {
            return Err(StorageError::new(
                EIO,
                format!("one or more errors while trimming chunks of '{}'", file_path),
            ));
        }
        Ok(())
    }

    /// Recursively remove the file's entire chunk directory.  A missing
    /// directory is not an error.
    pub fn destroy_chunk_space(&self, file_path: &str) -> StorageResult<()> {
        let dir = self.chunk_dir_path(file_path);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(
                format!("failed to remove chunk directory '{}'", dir.display()),
                &e,
            )),
        }
    }

    /// Space statistics of the file system backing `root_path`.
    pub fn chunk_stat(&self) -> StorageResult<ChunkStat> {
        let sfs = statvfs::statvfs(&self.root_path).map_err(|e| {
            StorageError::new(
                e as i32,
                format!(
                    "failed to stat file system of chunk root '{}'",
                    self.root_path.display()
                ),
            )
        })?;
        let bytes_total = sfs.fragment_size() as u64 * sfs.blocks() as u64;
        let bytes_free = sfs.fragment_size() as u64 * sfs.blocks_available() as u64;
        debug!(
            bytes_total,
            bytes_free,
            chunksize = self.chunksize,
            "chunk stat"
        );
        Ok(ChunkStat {
            chunk_size: self.chunksize,
            chunk_total: bytes_total / self.chunksize,
            chunk_free: bytes_free / self.chunksize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbfs_types::errno::ENOENT;
    use tempfile::TempDir;

    const CS: u64 = 8;

    fn store() -> (TempDir, ChunkStorage) {
        let dir = TempDir::new().unwrap();
        let storage = ChunkStorage::new(dir.path(), CS).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_relative_root_rejected() {
        let err = ChunkStorage::new("relative/root", CS).unwrap_err();
        assert_eq!(err.errno, EINVAL);
    }

    #[test]
    fn test_unreadable_root_rejected() {
        let err = ChunkStorage::new("/nonexistent-bbfs-root", CS).unwrap_err();
        assert_eq!(err.errno, ENOENT);
    }

    #[test]
    fn test_path_mangling() {
        assert_eq!(ChunkStorage::chunks_dir("/a"), "a");
        assert_eq!(ChunkStorage::chunks_dir("/a/b/c"), "a:b:c");
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, storage) = store();
        let wrote = storage.write_chunk("/f", 0, b"ABCDEFGH", 0).unwrap();
        assert_eq!(wrote, 8);

        let mut buf = [0u8; 8];
        let read = storage.read_chunk("/f", 0, &mut buf, 0).unwrap();
        assert_eq!(read, 8);
        assert_eq!(&buf, b"ABCDEFGH");
    }

    #[test]
    fn test_write_lands_in_mangled_dir() {
        let (dir, storage) = store();
        storage.write_chunk("/bench/out.dat", 3, b"xy", 0).unwrap();
        let on_disk = dir.path().join("bench:out.dat").join("3");
        assert_eq!(fs::read(on_disk).unwrap(), b"xy");
    }

    #[test]
    fn test_write_at_offset_leaves_hole() {
        let (_dir, storage) = store();
        storage.write_chunk("/f", 0, b"WXY", 5).unwrap();

        let mut buf = [0xAAu8; 8];
        let read = storage.read_chunk("/f", 0, &mut buf, 0).unwrap();
        // File length is 8 = offset 5 + 3 bytes; the hole reads as zeros.
        assert_eq!(read, 8);
        assert_eq!(&buf[..5], &[0; 5]);
        assert_eq!(&buf[5..], b"WXY");
    }

    #[test]
    fn test_read_missing_chunk_is_hole() {
        let (_dir, storage) = store();
        let mut buf = [0u8; 8];
        let read = storage.read_chunk("/f", 42, &mut buf, 0).unwrap();
        assert_eq!(read, 0);
    }

    #[test]
    fn test_short_read_at_eof() {
        let (_dir, storage) = store();
        storage.write_chunk("/f", 0, b"abc", 0).unwrap();

        let mut buf = [0u8; 8];
        let read = storage.read_chunk("/f", 0, &mut buf, 0).unwrap();
        assert_eq!(read, 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn test_read_at_offset() {
        let (_dir, storage) = store();
        storage.write_chunk("/f", 1, b"ABCDEFGH", 0).unwrap();

        let mut buf = [0u8; 3];
        let read = storage.read_chunk("/f", 1, &mut buf, 4).unwrap();
        assert_eq!(read, 3);
        assert_eq!(&buf, b"EFG");
    }

    #[test]
    fn test_range_precondition() {
        let (_dir, storage) = store();
        let err = storage.write_chunk("/f", 0, b"ABCDEFGH", 1).unwrap_err();
        assert_eq!(err.errno, EINVAL);

        let mut buf = [0u8; 8];
        let err = storage.read_chunk("/f", 0, &mut buf, 1).unwrap_err();
        assert_eq!(err.errno, EINVAL);
    }

    #[test]
    fn test_truncate_chunk_file() {
        let (_dir, storage) = store();
        storage.write_chunk("/f", 0, b"ABCDEFGH", 0).unwrap();
        storage.truncate_chunk_file("/f", 0, 2).unwrap();

        let mut buf = [0u8; 8];
        let read = storage.read_chunk("/f", 0, &mut buf, 0).unwrap();
        assert_eq!(read, 2);
        assert_eq!(&buf[..2], b"AB");
    }

    #[test]
    fn test_truncate_length_preconditions() {
        let (_dir, storage) = store();
        storage.write_chunk("/f", 0, b"ABCD", 0).unwrap();
        assert_eq!(
            storage.truncate_chunk_file("/f", 0, 0).unwrap_err().errno,
            EINVAL
        );
        assert_eq!(
            storage
                .truncate_chunk_file("/f", 0, CS + 1)
                .unwrap_err()
                .errno,
            EINVAL
        );
    }

    #[test]
    fn test_truncate_missing_chunk_is_enoent() {
        let (_dir, storage) = store();
        storage.write_chunk("/f", 0, b"x", 0).unwrap();
        let err = storage.truncate_chunk_file("/f", 7, 2).unwrap_err();
        assert_eq!(err.errno, ENOENT);
    }

    #[test]
    fn test_trim_removes_tail_chunks() {
        let (dir, storage) = store();
        for id in 0..4 {
            storage.write_chunk("/f", id, b"data", 0).unwrap();
        }
        storage.trim_chunk_space("/f", 2).unwrap();

        assert!(dir.path().join("f").join("0").exists());
        assert!(dir.path().join("f").join("1").exists());
        assert!(!dir.path().join("f").join("2").exists());
        assert!(!dir.path().join("f").join("3").exists());
    }

    #[test]
    fn test_trim_is_idempotent() {
        let (_dir, storage) = store();
        for id in 0..3 {
            storage.write_chunk("/f", id, b"data", 0).unwrap();
        }
        storage.trim_chunk_space("/f", 1).unwrap();
        storage.trim_chunk_space("/f", 1).unwrap();
    }

    #[test]
    fn test_trim_missing_directory_ok() {
        let (_dir, storage) = store();
        storage.trim_chunk_space("/never-written", 0).unwrap();
    }

    #[test]
    fn test_destroy_chunk_space() {
        let (dir, storage) = store();
        storage.write_chunk("/f", 0, b"data", 0).unwrap();
        storage.destroy_chunk_space("/f").unwrap();
        assert!(!dir.path().join("f").exists());
        // Missing directory is not an error.
        storage.destroy_chunk_space("/f").unwrap();
    }

    #[test]
    fn test_chunk_stat_sane() {
        let (_dir, storage) = store();
        let stat = storage.chunk_stat().unwrap();
        assert_eq!(stat.chunk_size, CS);
        assert!(stat.chunk_total > 0);
        assert!(stat.chunk_free <= stat.chunk_total);
    }

    #[test]
    fn test_overwrite_within_chunk() {
        let (_dir, storage) = store();
        storage.write_chunk("/f", 0, b"aaaaaaaa", 0).unwrap();
        storage.write_chunk("/f", 0, b"bb", 2).unwrap();

        let mut buf = [0u8; 8];
        storage.read_chunk("/f", 0, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"aabbaaaa");
    }
}
