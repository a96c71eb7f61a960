//! Node and client configuration loading.

use std::{
    env, fs,
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    time::Duration,
};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};

/// Default location on disk where the node looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/node.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "SCORE_MESH_CONFIG_PATH";
const DEFAULT_PORT: u16 = 3000;
/// Route target used to find the outbound interface when no peer address is an IP literal.
/// Connecting a UDP socket only consults the routing table; nothing is sent.
const ROUTE_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 9);

/// Where a node keeps its scores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-process tables, lost on restart.
    #[default]
    Memory,
    /// MongoDB reached through `uri`.
    Mongo {
        uri: String,
        #[serde(default)]
        database: Option<String>,
    },
}

/// LAN scan run at startup to find nodes nobody configured.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDiscoveryConfig {
    /// IPv4 networks in CIDR notation, e.g. `192.168.1.0/24`.
    pub ip_ranges: Vec<String>,
    pub ports: Vec<u16>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ping_timeout: Duration,
    /// Pings in flight at once.
    pub concurrency: usize,
}

impl Default for AutoDiscoveryConfig {
    fn default() -> Self {
        Self {
            ip_ranges: Vec::new(),
            ports: vec![DEFAULT_PORT],
            ping_timeout: Duration::from_secs(2),
            concurrency: 64,
        }
    }
}

/// Periods and timeouts of the background cluster tasks.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterTimings {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub health_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub outbox_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub replication_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub push_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub feed_keep_alive: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub merge_timeout: Duration,
}

impl ClusterTimings {
    /// A feed follower gives up on a stream that stayed silent this long.
    pub fn feed_idle_timeout(&self) -> Duration {
        self.feed_keep_alive * 3
    }
}

impl Default for ClusterTimings {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            outbox_interval: Duration::from_secs(9),
            replication_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            push_timeout: Duration::from_secs(3),
            feed_keep_alive: Duration::from_secs(15),
            merge_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
/// Runtime configuration of a cluster node.
pub struct NodeConfig {
    pub bind_addr: SocketAddr,
    /// Address peers use to reach this node; derived from the bind address when absent.
    pub advertise_addr: Option<String>,
    /// Seed peer addresses (`host:port`).
    pub peers: Vec<String>,
    /// File remembering peers discovered through gossip across restarts.
    pub known_nodes_path: Option<PathBuf>,
    pub storage: StorageConfig,
    pub timings: ClusterTimings,
    /// Disabled when absent.
    pub auto_discovery: Option<AutoDiscoveryConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            advertise_addr: None,
            peers: Vec::new(),
            known_nodes_path: None,
            storage: StorageConfig::default(),
            timings: ClusterTimings::default(),
            auto_discovery: None,
        }
    }
}

impl NodeConfig {
    /// Load the node configuration from disk and the environment, falling back to defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<NodeConfig>(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        peers = config.peers.len(),
                        "loaded node config"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        };

        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    /// Apply `PORT`, `ADVERTISE_ADDR`, `PEERS`, `MONGO_URI`, `MONGO_DB` and
    /// `KNOWN_NODES_PATH` taken from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(raw) = lookup("PORT") {
            match raw.trim().parse::<u16>() {
                Ok(port) => self.bind_addr.set_port(port),
                Err(err) => warn!(value = %raw, error = %err, "ignoring invalid PORT"),
            }
        }
        if let Some(addr) = lookup("ADVERTISE_ADDR") {
            self.advertise_addr = Some(addr.trim().to_owned());
        }
        if let Some(peers) = lookup("PEERS") {
            self.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|peer| !peer.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(uri) = lookup("MONGO_URI") {
            self.storage = StorageConfig::Mongo {
                uri,
                database: lookup("MONGO_DB"),
            };
        }
        if let Some(path) = lookup("KNOWN_NODES_PATH") {
            self.known_nodes_path = Some(PathBuf::from(path));
        }
    }

    /// Address this node announces to peers. A wildcard bind address is replaced by the address
    /// of the interface that routes to the first peer, so nodes on different hosts never
    /// announce the same loopback address.
    pub fn advertised_address(&self) -> String {
        if let Some(addr) = &self.advertise_addr {
            return addr.clone();
        }
        let bind_ip = self.bind_addr.ip();
        let ip = if bind_ip.is_unspecified() {
            let target = self
                .peers
                .iter()
                .find_map(|peer| peer.parse::<SocketAddr>().ok())
                .unwrap_or(ROUTE_TARGET);
            interface_ip(bind_ip, outbound_ip(target))
        } else {
            bind_ip
        };
        SocketAddr::new(ip, self.bind_addr.port()).to_string()
    }

    /// Configured peers followed by remembered ones, without duplicates or `self_address`.
    pub fn seed_peers(&self, self_address: &str) -> IndexSet<String> {
        let remembered = self
            .known_nodes_path
            .as_deref()
            .map(read_known_nodes)
            .unwrap_or_default();

        self.peers
            .iter()
            .cloned()
            .chain(remembered)
            .filter(|peer| peer != self_address)
            .collect()
    }
}

/// Local address the OS would send from to reach `target`.
fn outbound_ip(target: SocketAddr) -> io::Result<IpAddr> {
    let local: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local)?;
    socket.connect(target)?;
    Ok(socket.local_addr()?.ip())
}

/// IP to advertise for a wildcard `bind_ip`, given the routed interface address.
fn interface_ip(bind_ip: IpAddr, routed: io::Result<IpAddr>) -> IpAddr {
    let loopback = match bind_ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    };
    match routed {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => loopback,
        Err(err) => {
            warn!(
                error = %err,
                "no routable interface found; advertising loopback, set ADVERTISE_ADDR for multi-host clusters"
            );
            loopback
        }
    }
}

/// Read the remembered peer list; a missing or unreadable file yields no peers.
pub fn read_known_nodes(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<Vec<String>>(&contents) {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring malformed known nodes file");
                Vec::new()
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read known nodes file");
            Vec::new()
        }
    }
}

/// Persist the peer list next to the node configuration.
pub fn write_known_nodes<'a>(
    path: &Path,
    nodes: impl IntoIterator<Item = &'a String>,
) -> io::Result<()> {
    let nodes: Vec<&String> = nodes.into_iter().collect();
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(&nodes).map_err(io::Error::other)?;
    fs::write(path, contents)
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Settings of the game-facing [`FailoverClient`](crate::client::FailoverClient).
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Ordered candidate node addresses (`host:port`).
    pub candidates: Vec<String>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub health_interval: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub probe_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ping_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_delay: Duration,
    pub max_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// Address the local fallback host binds to.
    pub fallback_bind: SocketAddr,
}

impl FailoverConfig {
    /// Defaults with the given candidates.
    pub fn with_candidates<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            health_interval: Duration::from_secs(8),
            probe_timeout: Duration::from_secs(3),
            ping_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_millis(500),
            max_retries: 3,
            request_timeout: Duration::from_secs(10),
            fallback_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn timings_parse_from_milliseconds() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"peers":["10.0.0.2:3000"],"timings":{"health_interval":250}}"#)
                .unwrap();
        assert_eq!(config.timings.health_interval, Duration::from_millis(250));
        assert_eq!(config.timings.outbox_interval, Duration::from_secs(9));
        assert_eq!(config.timings.feed_idle_timeout(), Duration::from_secs(45));
        assert_eq!(config.peers, vec!["10.0.0.2:3000".to_string()]);
    }

    #[test]
    fn environment_overrides_replace_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PORT", "4100"),
            ("PEERS", "10.0.0.2:3000, ,10.0.0.3:3000"),
            ("MONGO_URI", "mongodb://db:27017"),
            ("ADVERTISE_ADDR", "game-host:4100"),
        ]);
        let mut config = NodeConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|value| value.to_string()));

        assert_eq!(config.bind_addr.port(), 4100);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.advertised_address(), "game-host:4100");
        assert_eq!(
            config.storage,
            StorageConfig::Mongo {
                uri: "mongodb://db:27017".into(),
                database: None
            }
        );
    }

    #[test]
    fn wildcard_bind_advertises_the_routed_interface() {
        let wildcard = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let host_a = interface_ip(wildcard, Ok("10.0.0.5".parse().unwrap()));
        let host_b = interface_ip(wildcard, Ok("10.0.0.7".parse().unwrap()));
        assert_ne!(host_a, host_b);
        assert_eq!(host_a, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(
            interface_ip(wildcard, Err(io::Error::other("no route"))),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
    }

    #[test]
    fn wildcard_bind_routes_towards_the_first_peer() {
        let config = NodeConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 4200)),
            peers: vec!["peer-host:3000".into(), "127.0.0.1:3001".into()],
            ..NodeConfig::default()
        };
        assert_eq!(config.advertised_address(), "127.0.0.1:4200");

        let specific = NodeConfig {
            bind_addr: SocketAddr::from(([192, 168, 1, 20], 4200)),
            ..NodeConfig::default()
        };
        assert_eq!(specific.advertised_address(), "192.168.1.20:4200");
    }

    #[test]
    fn auto_discovery_parses_with_defaults() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"auto_discovery":{"ip_ranges":["192.168.1.0/24"],"ports":[3000,3001]}}"#,
        )
        .unwrap();
        let discovery = config.auto_discovery.unwrap();
        assert_eq!(discovery.ip_ranges, vec!["192.168.1.0/24".to_string()]);
        assert_eq!(discovery.ports, vec![3000, 3001]);
        assert_eq!(discovery.concurrency, 64);
        assert!(NodeConfig::default().auto_discovery.is_none());
    }

    #[test]
    fn seed_peers_skip_self_and_duplicates() {
        let config = NodeConfig {
            peers: vec![
                "127.0.0.1:3000".into(),
                "127.0.0.1:3001".into(),
                "127.0.0.1:3001".into(),
            ],
            ..NodeConfig::default()
        };
        let seeds = config.seed_peers("127.0.0.1:3000");
        assert_eq!(seeds.into_iter().collect::<Vec<_>>(), vec!["127.0.0.1:3001"]);
    }

    #[test]
    fn known_nodes_file_round_trips() {
        let path = env::temp_dir().join(format!("score-mesh-known-{}.json", uuid::Uuid::new_v4()));
        let nodes = vec!["10.0.0.4:3000".to_string()];
        write_known_nodes(&path, &nodes).unwrap();
        assert_eq!(read_known_nodes(&path), nodes);
        let _ = fs::remove_file(&path);
        assert!(read_known_nodes(&path).is_empty());
    }
}
