use thiserror::Error;

use bbfs_net::NetError;
use bbfs_types::errno::{EBUSY, EINVAL};

/// Failure of a dispatched data operation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport gave up (timeout after all retries, bulk failure,
    /// unknown host).  Surfaces to callers as `EBUSY`.
    #[error("transport failure: {0}")]
    Transport(#[from] NetError),

    /// A daemon reported a disk-level errno in its response.
    #[error("remote i/o error (errno {0})")]
    Remote(i32),

    /// The operation's arguments are inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Daemons disagree on the deployment chunk size.
    #[error("chunk size mismatch across daemons: {0} vs {1}")]
    ChunkSizeMismatch(u64, u64),
}

impl ClientError {
    /// The errno equivalent reported to POSIX-level callers.
    pub fn errno(&self) -> i32 {
        match self {
            ClientError::Transport(_) => EBUSY,
            ClientError::Remote(errno) => *errno,
            ClientError::InvalidArgument(_) => EINVAL,
            ClientError::ChunkSizeMismatch(..) => EINVAL,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use bbfs_types::errno::ENOSPC;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(ClientError::Transport(NetError::Timeout).errno(), EBUSY);
        assert_eq!(ClientError::Remote(ENOSPC).errno(), ENOSPC);
        assert_eq!(
            ClientError::InvalidArgument("bad".into()).errno(),
            EINVAL
        );
    }
}
