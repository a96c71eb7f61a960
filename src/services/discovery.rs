//! Startup scan of configured LAN ranges for nodes nobody listed as a peer.

use std::net::{Ipv4Addr, SocketAddr};

use futures::{StreamExt, stream};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{config::AutoDiscoveryConfig, state::SharedState};

/// Shortest prefix accepted.
const MIN_PREFIX: u8 = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("`{0}` is not an IPv4 network in CIDR notation")]
    InvalidRange(String),
    #[error("`{range}` is wider than /16")]
    RangeTooWide { range: String },
}

/// Host addresses of an IPv4 network, without its network and broadcast addresses for
/// prefixes shorter than /31.
pub fn expand_range(range: &str) -> Result<Vec<Ipv4Addr>, DiscoveryError> {
    let invalid = || DiscoveryError::InvalidRange(range.to_owned());
    let (base, prefix) = range.trim().split_once('/').ok_or_else(invalid)?;
    let base: Ipv4Addr = base.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    if prefix < MIN_PREFIX {
        return Err(DiscoveryError::RangeTooWide {
            range: range.to_owned(),
        });
    }

    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    let network = u32::from(base) & mask;
    let last = network | !mask;
    let hosts = if prefix >= 31 {
        network..=last
    } else {
        network + 1..=last - 1
    };
    Ok(hosts.map(Ipv4Addr::from).collect())
}

/// Ping every host and port of `config` and return the addresses of the nodes that answered,
/// other than this one.
pub async fn scan(state: &SharedState, config: &AutoDiscoveryConfig) -> Vec<String> {
    let mut targets = Vec::new();
    for range in &config.ip_ranges {
        match expand_range(range) {
            Ok(hosts) => {
                for host in hosts {
                    targets.extend(
                        config
                            .ports
                            .iter()
                            .map(|port| SocketAddr::from((host, *port)).to_string()),
                    );
                }
            }
            Err(err) => warn!(error = %err, "skipping discovery range"),
        }
    }
    targets.retain(|target| target != state.address());
    info!(targets = targets.len(), "scanning for cluster nodes");

    let api = state.peers();
    let limit = config.ping_timeout;
    let found: Vec<String> = stream::iter(targets)
        .map(|target| async move {
            match api.ping(&target, limit).await {
                Ok(ping) if ping.node_id != state.node_id() => Some(target),
                Ok(_) => None,
                Err(err) => {
                    debug!(target = %target, error = %err, "no node at address");
                    None
                }
            }
        })
        .buffer_unordered(config.concurrency.max(1))
        .filter_map(|found| async move { found })
        .collect()
        .await;

    info!(found = found.len(), "network scan finished");
    found
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{config::NodeConfig, node::Node, services::test_support::memory_state};

    #[test]
    fn ranges_expand_to_host_addresses() {
        let hosts = expand_range("192.168.1.0/24").unwrap();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(hosts[253], Ipv4Addr::new(192, 168, 1, 254));

        assert_eq!(
            expand_range("10.0.0.9/30").unwrap(),
            vec![Ipv4Addr::new(10, 0, 0, 9), Ipv4Addr::new(10, 0, 0, 10)]
        );
        assert_eq!(expand_range("127.0.0.1/32").unwrap(), vec![Ipv4Addr::LOCALHOST]);
    }

    #[test]
    fn malformed_or_huge_ranges_are_refused() {
        assert!(matches!(
            expand_range("192.168.1.0"),
            Err(DiscoveryError::InvalidRange(_))
        ));
        assert!(matches!(
            expand_range("192.168.1.0/33"),
            Err(DiscoveryError::InvalidRange(_))
        ));
        assert!(matches!(
            expand_range("10.0.0.0/8"),
            Err(DiscoveryError::RangeTooWide { .. })
        ));
    }

    #[tokio::test]
    async fn scan_finds_a_running_node() {
        let node = Node::bind(NodeConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..NodeConfig::default()
        })
        .await
        .unwrap();
        let (state, _store) = memory_state().await;
        let config = AutoDiscoveryConfig {
            ip_ranges: vec!["127.0.0.1/32".into(), "not-a-range".into()],
            ports: vec![node.local_addr().port(), 9],
            ping_timeout: Duration::from_millis(500),
            concurrency: 4,
        };

        let found = scan(&state, &config).await;
        assert_eq!(found, vec![node.address().to_owned()]);
        node.shutdown().await.unwrap();
    }
}
