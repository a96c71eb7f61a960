/// Immediate push, polling fallback and the change feed stream.
pub mod change_feed;
/// OpenAPI documentation generation.
pub mod documentation;
/// LAN scan for unconfigured nodes.
pub mod discovery;
/// Advisory primary election.
pub mod election;
/// Replication outbox flushing.
pub mod outbox;
/// Peer probing and gossip discovery.
pub mod registry;
/// Applying changes from peers, bulk merge and export.
pub mod replication_service;
/// Game-facing score operations.
pub mod score_service;
/// Liveness and status reporting.
pub mod status_service;
/// Storage connection supervisor with backoff.
pub mod storage_supervisor;
