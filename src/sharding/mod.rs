/*!
Key → shard resolution: the cluster slot table, endpoint → shard mapping
and the pluggable key sharders used outside cluster mode.
*/
mod key_shard;
mod shard_info;
mod slot_map;

pub use key_shard::*;
pub use shard_info::*;
pub use slot_map::*;
