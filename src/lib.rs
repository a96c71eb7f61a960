//! Library crate for score-mesh: a replicated leaderboard node, its peer client and the
//! game-facing failover client.

pub mod client;
pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod node;
pub mod routes;
pub mod services;
pub mod state;
