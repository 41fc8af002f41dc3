use std::sync::Arc;

use bbfs_types::HostId;

use crate::bulk::BulkRegistry;
use crate::error::NetError;
use crate::service::DataService;

/// One reachable daemon: its RPC service plus the transport endpoint whose
/// registry resolves bulk descriptors sent to it.
#[derive(Clone)]
pub struct Endpoint {
    pub service: Arc<dyn DataService>,
    pub transport: Arc<BulkRegistry>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").finish_non_exhaustive()
    }
}

/// Out-of-band address directory mapping `HostId` to endpoints.
///
/// How the directory is populated (hostfile, service discovery) is outside
/// the data plane; it only promises a stable, dense `[0, host_size)` id
/// space.
pub struct Directory {
    hosts: Vec<Endpoint>,
}

impl Directory {
    pub fn new(hosts: Vec<Endpoint>) -> Self {
        Self { hosts }
    }

    pub fn host_size(&self) -> u32 {
        self.hosts.len() as u32
    }

    pub fn endpoint(&self, host: HostId) -> Result<&Endpoint, NetError> {
        self.hosts
            .get(host.as_usize())
            .ok_or(NetError::UnknownHost(host))
    }
}
