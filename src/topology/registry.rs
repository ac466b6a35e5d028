//! Node registry: matching config server addresses to live connections.
//!
//! The registry is rebuilt on every significant config change. Matching is a
//! best-effort string comparison against two encodings of each connection's
//! peer, literal hostname and resolved IP, because DNS and reverse-DNS may
//! disagree between the config source and the connection layer. Both checks
//! are required for correctness, not an optimization.
//!
//! A config address with no matching live connection is dropped from the
//! published map and logged at error level, so routing to it fails loudly
//! instead of silently reusing a stale handle.

use crate::topology::cluster::ClusterConfig;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

/// Identifier for an established connection, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A server's entry in the routing map.
///
/// Owned by the registry via the published map; the locator and throttle
/// controller hold `Arc` references looked up by address on every use and
/// never cache one across a snapshot swap.
#[derive(Debug)]
pub struct NodeHandle {
    /// Address as it appears in the cluster config (`host:port`).
    pub address: String,
    /// Underlying connection, resolved by the transport layer.
    pub connection: ConnectionId,
    /// When the handle was matched into the current map.
    pub matched_at: Instant,
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.connection == other.connection
    }
}

impl Eq for NodeHandle {}

impl std::hash::Hash for NodeHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.connection.hash(state);
    }
}

/// A live connection as reported by the transport layer.
#[derive(Debug, Clone)]
pub struct LiveConnection {
    /// Hostname the connection was opened against.
    pub hostname: String,
    /// Resolved peer IP, when the transport knows it.
    pub resolved_ip: Option<IpAddr>,
    /// Peer port.
    pub port: u16,
    /// Transport connection id.
    pub id: ConnectionId,
}

impl LiveConnection {
    /// The address encodings this connection can be matched under.
    fn candidate_addresses(&self) -> Vec<String> {
        let mut candidates = vec![format!("{}:{}", self.hostname, self.port)];
        if let Some(ip) = self.resolved_ip {
            candidates.push(format!("{}:{}", ip, self.port));
        }
        candidates
    }
}

/// Address-keyed map of node handles, published inside a routing snapshot.
pub type NodeMap = HashMap<String, Arc<NodeHandle>>;

/// Builds the address-to-handle map for a config.
pub struct NodeRegistry;

impl NodeRegistry {
    /// Build a fresh node map for `config` from the current live connections.
    ///
    /// Every server address in the config is seeded, then each connection is
    /// matched in under both of its address encodings. Addresses left
    /// unmatched are dropped and reported.
    pub fn build(config: &ClusterConfig, live: &[LiveConnection]) -> NodeMap {
        let mut slots: HashMap<&str, Option<Arc<NodeHandle>>> = config
            .servers
            .iter()
            .map(|addr| (addr.as_str(), None))
            .collect();

        for conn in live {
            for candidate in conn.candidate_addresses() {
                if let Some(slot @ None) = slots.get_mut(candidate.as_str()) {
                    *slot = Some(Arc::new(NodeHandle {
                        address: candidate.clone(),
                        connection: conn.id,
                        matched_at: Instant::now(),
                    }));
                    break;
                }
            }
        }

        let mut map = NodeMap::with_capacity(slots.len());
        for (address, slot) in slots {
            match slot {
                Some(handle) => {
                    map.insert(address.to_string(), handle);
                }
                None => {
                    // Consistency error between the config source and the
                    // connection layer. The address stays out of the map.
                    tracing::error!(
                        address,
                        bucket = %config.bucket,
                        sequence = config.sequence,
                        "config server has no matching live connection; dropping from routing map"
                    );
                }
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::cluster::ClusterConfig;

    fn two_node_config() -> ClusterConfig {
        ClusterConfig::parse(
            r#"{
                "name": "b", "rev": 1,
                "serverList": ["alpha.example.com:11210", "10.0.0.2:11210"],
                "vBucketMap": [[0], [1]]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn matches_by_hostname() {
        let config = two_node_config();
        let live = vec![LiveConnection {
            hostname: "alpha.example.com".to_string(),
            resolved_ip: Some("10.0.0.1".parse().unwrap()),
            port: 11210,
            id: ConnectionId(1),
        }];
        let map = NodeRegistry::build(&config, &live);
        assert_eq!(map.len(), 1);
        assert_eq!(map["alpha.example.com:11210"].connection, ConnectionId(1));
    }

    #[test]
    fn matches_by_resolved_ip_when_hostname_differs() {
        let config = two_node_config();
        let live = vec![LiveConnection {
            hostname: "beta.internal".to_string(),
            resolved_ip: Some("10.0.0.2".parse().unwrap()),
            port: 11210,
            id: ConnectionId(2),
        }];
        let map = NodeRegistry::build(&config, &live);
        assert_eq!(map.len(), 1);
        assert_eq!(map["10.0.0.2:11210"].connection, ConnectionId(2));
    }

    #[test]
    fn unmatched_address_is_dropped() {
        let config = two_node_config();
        let map = NodeRegistry::build(&config, &[]);
        assert!(map.is_empty());
    }
}
