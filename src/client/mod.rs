/*!
The high-availability client: configuration, quorum discovery over the
sentinel pool and the command-routing orchestrator.
*/
mod config;
pub(crate) mod discovery;
pub(crate) mod sentinel_client;

pub use config::*;
pub use sentinel_client::*;
