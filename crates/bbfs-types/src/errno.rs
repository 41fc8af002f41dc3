//! Errno currency of the data plane.
//!
//! RPC responses carry raw errno values in their `err` field, so every layer
//! down to the chunk store reports failures as errnos.  The constants are
//! re-exported from `libc` so callers spell them the way the handler code
//! reads: `EBUSY`, `EIO`, `ENOSPC`, and so on.

pub use libc::{
    EACCES, EAGAIN, EBUSY, ECANCELED, EEXIST, EINTR, EINVAL, EIO, EISDIR, ENOENT, ENOSPC, EPERM,
    EWOULDBLOCK,
};

/// The "no error" value used in RPC response `err` fields.
pub const ERRNO_OK: i32 = 0;

/// Extract the OS errno from an I/O error, falling back to `EIO` for
/// synthetic errors that carry no OS code.
pub fn errno_of(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_of_os_error() {
        let err = std::io::Error::from_raw_os_error(ENOENT);
        assert_eq!(errno_of(&err), ENOENT);
    }

    #[test]
    fn test_errno_of_synthetic_error() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "no os code");
        assert_eq!(errno_of(&err), EIO);
    }
}
