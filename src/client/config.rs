use crate::{
    Error, Result,
    network::ConnectionInfo,
    sharding::KeyShard,
};
use std::{collections::HashSet, sync::Arc, time::Duration};

/// Invoked as `(shard_idx, shard_name, is_master, ready)` whenever a shard
/// role gains or loses its last usable instance.
pub type ReadyChangeCallback = Arc<dyn Fn(usize, &str, bool, bool) + Send + Sync>;

pub(crate) const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3);
pub(crate) const DEFAULT_CLUSTER_SLOTS_TIMEOUT: Duration = Duration::from_secs(4);

/// Configuration of a [`SentinelClient`](crate::client::SentinelClient).
#[derive(Clone)]
pub struct SentinelConfig {
    /// Ordered shard names; shard indexes derive from this order
    pub shards: Vec<String>,
    /// Sentinel pool endpoints (cluster nodes double as the pool in cluster
    /// mode)
    pub conns: Vec<ConnectionInfo>,
    pub shard_group_name: String,
    pub client_name: String,
    pub password: Option<String>,
    pub track_masters: bool,
    pub track_slaves: bool,
    pub is_subscriber: bool,
    /// `None` selects cluster mode with slot routing
    pub key_shard: Option<Arc<dyn KeyShard>>,
    pub ready_callback: Option<ReadyChangeCallback>,
    /// Interval between discovery & maintenance passes
    pub check_interval: Duration,
    /// Budget of one `CLUSTER SLOTS` probe
    pub cluster_slots_timeout: Duration,
}

impl SentinelConfig {
    pub fn new(shards: Vec<String>, conns: Vec<ConnectionInfo>) -> Self {
        Self {
            shards,
            conns,
            shard_group_name: String::new(),
            client_name: String::new(),
            password: None,
            track_masters: true,
            track_slaves: true,
            is_subscriber: false,
            key_shard: None,
            ready_callback: None,
            check_interval: DEFAULT_CHECK_INTERVAL,
            cluster_slots_timeout: DEFAULT_CLUSTER_SLOTS_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_shard_group_name(mut self, shard_group_name: impl Into<String>) -> Self {
        self.shard_group_name = shard_group_name.into();
        self
    }

    #[must_use]
    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_key_shard(mut self, key_shard: Arc<dyn KeyShard>) -> Self {
        self.key_shard = Some(key_shard);
        self
    }

    #[must_use]
    pub fn with_ready_callback(mut self, ready_callback: ReadyChangeCallback) -> Self {
        self.ready_callback = Some(ready_callback);
        self
    }

    #[must_use]
    pub fn track(mut self, track_masters: bool, track_slaves: bool) -> Self {
        self.track_masters = track_masters;
        self.track_slaves = track_slaves;
        self
    }

    #[must_use]
    pub fn subscriber(mut self, is_subscriber: bool) -> Self {
        self.is_subscriber = is_subscriber;
        self
    }

    #[must_use]
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(Error::Config("shard list cannot be empty".to_owned()));
        }
        if self.conns.is_empty() {
            return Err(Error::Config(
                "sentinel connection list cannot be empty".to_owned(),
            ));
        }
        let unique: HashSet<&String> = self.shards.iter().collect();
        if unique.len() != self.shards.len() {
            return Err(Error::Config("duplicate shard names".to_owned()));
        }
        Ok(())
    }
}
