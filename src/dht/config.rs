use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use super::id::NodeId;
use crate::constants::{DEFAULT_PORT, DHT_BOOTSTRAP_NODES, DHT_QUERY_TIMEOUT};

/// Settings for a [`DhtServer`](super::DhtServer).
///
/// ```
/// use rdht::dht::DhtConfig;
///
/// let config = DhtConfig {
///     listen_addr: "127.0.0.1:0".parse().unwrap(),
///     bootstrap_nodes: Vec::new(),
///     ..DhtConfig::default()
/// };
/// assert!(config.state_path.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub listen_addr: SocketAddr,
    /// `host:port` strings, resolved at bootstrap time.
    pub bootstrap_nodes: Vec<String>,
    /// Where to keep the routing table and values across restarts.
    pub state_path: Option<PathBuf>,
    pub query_timeout: Duration,
    /// Port sent in `announce_peer`; `None` sends `implied_port=1`.
    pub announce_port: Option<u16>,
    /// Identity for a fresh start. Ignored when saved state is loaded.
    pub node_id: Option<NodeId>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            bootstrap_nodes: DHT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            state_path: None,
            query_timeout: DHT_QUERY_TIMEOUT,
            announce_port: None,
            node_id: None,
        }
    }
}
