use std::time::Duration;

use serde::{Deserialize, Serialize};

use bbfs_net::RetryPolicy;

/// Client-side tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Chunk size in bytes; must match the daemons'.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Per-attempt RPC timeout in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// RPC attempts before an operation fails.
    #[serde(default = "default_rpc_tries")]
    pub rpc_tries: u32,
}

fn default_chunk_size() -> u64 {
    512 * 1024
}

fn default_rpc_timeout_ms() -> u64 {
    3000
}

fn default_rpc_tries() -> u32 {
    3
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            rpc_tries: default_rpc_tries(),
        }
    }
}

impl ClientConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            tries: self.rpc_tries,
            timeout: Duration::from_millis(self.rpc_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.chunk_size, 512 * 1024);
        assert_eq!(cfg.rpc_tries, 3);
        assert_eq!(cfg.retry_policy().timeout, Duration::from_secs(3));
    }
}
