pub mod cluster;
pub mod feed;
pub mod replication;
pub mod scores;
pub mod validation;
