/*!
Connection-facing plumbing: the collaborator contract implemented by the
connection layer, the per-shard connection set and the readiness gate.
*/
mod connected_status;
mod connection;
mod shard;

pub use connected_status::*;
pub use connection::*;
pub use shard::*;
