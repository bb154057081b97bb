pub(crate) mod control;
pub mod host;
pub mod token;


use std::sync::Arc;

use host::{Address, Host};
use token::{Partitioner, TokenMap};

/// Immutable view of the cluster published by the control connection.
/// Readers always see a whole snapshot; policies iterate it lock-free.
pub struct ClusterSnapshot {
    pub hosts: Vec<Arc<Host>>,
    pub token_map: Arc<TokenMap>,
}

impl ClusterSnapshot {
    pub(crate) fn empty() -> Self {
        Self {
            hosts: Vec::new(),
            token_map: Arc::new(TokenMap::empty(Partitioner::Murmur3)),
        }
    }

    pub fn host(&self, address: &Address) -> Option<&Arc<Host>> {
        self.hosts.iter().find(|h| &h.address == address)
    }
}
