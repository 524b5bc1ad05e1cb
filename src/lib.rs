/*!
sentira is a high-availability Redis client core for Rust.

# Philosophy
* Callback driven command path, no blocking in submission
* Single control-plane task, multi-threaded submission
* Bounded retries with absolute deadlines
* Rust idiomatic API

# Features
* Topology discovery through [Redis Sentinel](https://redis.io/docs/manual/sentinel/)
  (`SENTINEL MASTERS` / `SENTINEL SLAVES`) or through the
  [Redis Cluster](https://redis.io/docs/manual/scaling/) `CLUSTER SLOTS` protocol
* Quorum gating of every discovery pass over the sentinel pool
* Hash-slot routing (CRC16 of the `{tag}`) in cluster mode, pluggable
  key sharding ([`sharding::KeyShard`]) otherwise
* `MOVED` / `ASK` redirection handling with retry-budget restoration
* Transparent fallback from cluster mode to plain sharding when the
  discovered servers turn out not to be a cluster
* Per-shard readiness gates with deadline-bounded waits

# Scope
The crate owns routing, discovery and the retry state machine. The TCP
level (RESP framing, pipelining, reply parsing) is the business of the
connection layer, consumed through the [`network::RedisConnection`] and
[`network::ConnectionFactory`] traits; replies enter the core already
parsed as [`resp::Value`] trees.

# Basic usage

```no_run
use std::sync::Arc;
use sentira::{
    client::{SentinelClient, SentinelConfig},
    command::{Command, CommandControl},
    network::ConnectionInfo,
    resp::cmd,
};

# fn factory() -> Arc<dyn sentira::network::ConnectionFactory> { unimplemented!() }
#[tokio::main]
async fn main() -> sentira::Result<()> {
    let config = SentinelConfig::new(
        vec!["shard0".to_owned(), "shard1".to_owned()],
        vec![ConnectionInfo::new("10.0.0.1", 26379)],
    );
    let client = SentinelClient::new(config, factory())?;
    client.start();

    let command = Command::new(
        cmd("GET").arg("foo"),
        Arc::new(|_command, reply| println!("reply: {reply:?}")),
        CommandControl::default(),
    );
    client.async_command(command, b"foo", false);
    Ok(())
}
```
*/

pub mod client;
pub mod command;
mod error;
pub mod network;
pub mod resp;
pub mod sharding;
mod signal;

pub use error::*;
pub use signal::Signal;

/// Library general result type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests;
