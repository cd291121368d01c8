//! CLI/env configuration (ambient stack, §2). Grounded on the teacher's
//! `parse_database_url` (`--flag` then env var fallback) but widened to a
//! real multi-flag surface via `clap`'s derive API, since this daemon has
//! more than one setting to wire up.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "lockd-server", about = "Distributed mutual-exclusion coordinator node")]
pub struct Config {
    /// Address this node's gRPC services bind to.
    #[arg(long, env = "LOCKD_BIND", default_value = "0.0.0.0:4950")]
    pub bind: std::net::SocketAddr,

    /// This node's externally-reachable IP, used for election ownership
    /// and the node identity string (§6.4).
    #[arg(long, env = "LOCKD_IP")]
    pub ip: String,

    /// Unique name for this node within the cluster.
    #[arg(long, env = "LOCKD_NODE_NAME")]
    pub node_name: String,

    /// 1..14 = candidate leader priority, 15 = never elected (§3).
    #[arg(long, env = "LOCKD_PRIORITY", default_value_t = 5)]
    pub priority: u8,

    /// Total number of coordinator nodes in the cluster, used for the
    /// quorum/completeness readiness rule (§4.1).
    #[arg(long, env = "LOCKD_TOTAL_NODES")]
    pub total_nodes: usize,

    /// Peer coordinator addresses as `name=http://host:port`, repeatable.
    #[arg(long = "peer", env = "LOCKD_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PeerAddr {
    pub name: String,
    pub endpoint: String,
}

impl Config {
    pub fn parsed_peers(&self) -> anyhow::Result<Vec<PeerAddr>> {
        self.peers
            .iter()
            .map(|entry| {
                let (name, endpoint) = entry.split_once('=').ok_or_else(|| {
                    anyhow::anyhow!("peer entry `{entry}` must be `name=endpoint`")
                })?;
                Ok(PeerAddr {
                    name: name.to_string(),
                    endpoint: endpoint.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peer_entries() {
        let cfg = Config {
            bind: "0.0.0.0:4950".parse().unwrap(),
            ip: "10.0.0.1".into(),
            node_name: "a".into(),
            priority: 5,
            total_nodes: 3,
            peers: vec!["b=http://10.0.0.2:4950".into(), "c=http://10.0.0.3:4950".into()],
        };
        let parsed = cfg.parsed_peers().unwrap();
        assert_eq!(parsed[0].name, "b");
        assert_eq!(parsed[1].endpoint, "http://10.0.0.3:4950");
    }

    #[test]
    fn rejects_malformed_peer_entry() {
        let cfg = Config {
            bind: "0.0.0.0:4950".parse().unwrap(),
            ip: "10.0.0.1".into(),
            node_name: "a".into(),
            priority: 5,
            total_nodes: 3,
            peers: vec!["not-a-valid-entry".into()],
        };
        assert!(cfg.parsed_peers().is_err());
    }
}
