use crate::sharding::UNKNOWN_SHARD;
use std::{collections::HashMap, sync::Mutex};

pub type HostPortToShardMap = HashMap<(String, u16), usize>;

/// Endpoint → shard resolution, rebuilt on every successful discovery pass
/// and consulted to resolve MOVED/ASK targets and `CLUSTER SLOTS` rows back
/// to shard identity.
#[derive(Default)]
pub struct ShardInfo {
    host_port_to_shard: Mutex<HostPortToShardMap>,
}

impl ShardInfo {
    pub fn shard(&self, host: &str, port: u16) -> usize {
        let map = self.host_port_to_shard.lock().unwrap();
        map.get(&(host.to_owned(), port))
            .copied()
            .unwrap_or(UNKNOWN_SHARD)
    }

    /// Replaces the whole map in one step; a no-op when nothing changed.
    pub fn update(&self, host_port_to_shard: HostPortToShardMap) {
        let mut map = self.host_port_to_shard.lock().unwrap();
        if *map != host_port_to_shard {
            *map = host_port_to_shard;
        }
    }
}
