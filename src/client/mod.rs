//! HTTP clients of the node API: the peer client used between nodes, and the game-facing
//! failover client with its local fallback host.

mod error;
mod failover;
mod fallback;
mod node_api;

pub use error::{ClientError, ClientResult};
pub use failover::{ConnectionState, FailoverClient};
pub use fallback::FallbackHost;
pub use node_api::NodeApi;
