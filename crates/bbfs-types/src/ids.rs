use serde::{Deserialize, Serialize};

/// Index of a chunk within its file.
///
/// Chunk `k` covers file bytes `[k * chunk_size, (k + 1) * chunk_size)`.
/// Kept as a plain alias because chunk ids are arithmetic-heavy: the data
/// path constantly computes ranges, differences, and byte offsets from them.
pub type ChunkId = u64;

/// Identifier of a daemon within the deployment, in `[0, host_size)`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct HostId(pub u32);

impl HostId {
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for HostId {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_id_display_debug() {
        let id = HostId(3);
        assert_eq!(format!("{}", id), "3");
        assert_eq!(format!("{:?}", id), "HostId(3)");
    }

    #[test]
    fn test_host_id_ord() {
        assert!(HostId(1) < HostId(2));
        assert_eq!(HostId(7), HostId(7));
    }

    #[test]
    fn test_host_id_serde_transparent() {
        let id = HostId(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "42");
        let parsed: HostId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
