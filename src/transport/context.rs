//! The process-wide protocol engine: every piece of global state the
//! dispatcher, pacer and timer share.
//!
//! This plays the role the teacher's per-connection `rpc::Context` plays
//! for one NFS client, generalized to the single process-wide instance
//! Homa's design calls for (§3 "Global state", §5): one socket table, one
//! peer table, one grant scheduler, one pacer, one metrics set, shared by
//! every socket and every thread that enters the transport.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::config::HomaConfig;
use crate::metrics::Metrics;
use crate::transport::grant::GrantScheduler;
use crate::transport::pacer::Pacer;
use crate::transport::peer::PeerTable;
use crate::transport::socket::SocketTable;

pub struct Engine {
    pub sockets: SocketTable,
    pub peers: PeerTable,
    pub grants: GrantScheduler,
    pub pacer: Pacer,
    pub metrics: Metrics,
    config: RwLock<HomaConfig>,
}

impl Engine {
    pub fn new(config: HomaConfig) -> Arc<Self> {
        Arc::new(Self {
            sockets: SocketTable::new(),
            peers: PeerTable::new(),
            grants: GrantScheduler::new(),
            pacer: Pacer::new(),
            metrics: Metrics::new(),
            config: RwLock::new(config),
        })
    }

    pub fn config(&self) -> RwLockReadGuard<'_, HomaConfig> {
        self.config.read()
    }

    /// The "prios-changed" hook (§6): applies new cutoffs and bumps the
    /// version every peer will be told to refresh against.
    pub fn set_cutoffs(&self, cutoffs: [u32; crate::config::NUM_PRIORITIES]) {
        self.config.write().set_cutoffs(cutoffs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_cutoffs_bumps_version() {
        let engine = Engine::new(HomaConfig::default());
        let before = engine.config().cutoff_version();
        engine.set_cutoffs([1; crate::config::NUM_PRIORITIES]);
        assert!(engine.config().cutoff_version() > before);
    }
}
