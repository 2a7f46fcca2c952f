//! Cluster layout as seen by schema propagation and `remote_servers.xml`.

use serde::{Deserialize, Serialize};

use crate::{CLIENT_PORT, HTTP_PORT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub internal_replication: bool,
    pub replicas: Vec<Replica>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Replica {
    pub host: String,
    /// Native protocol port
    pub port: i32,
    /// HTTP interface port
    pub http_port: i32,
}

impl Replica {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into(), port: CLIENT_PORT, http_port: HTTP_PORT }
    }
}

impl Shard {
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.replicas.iter().map(|r| r.host.as_str())
    }
}

/// Number of hosts across every shard.
pub fn host_count(topology: &[Shard]) -> usize {
    topology.iter().map(|s| s.replicas.len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_hosts_over_shards() {
        let shard = |n: usize| Shard {
            internal_replication: true,
            replicas: (0..n).map(|i| Replica::new(format!("h{}", i))).collect(),
        };
        assert_eq!(host_count(&[shard(2), shard(3)]), 5);
        assert_eq!(host_count(&[]), 0);
        assert_eq!(shard(1).replicas[0].port, 9000);
        assert_eq!(shard(2).hosts().collect::<Vec<_>>(), vec!["h0", "h1"]);
    }
}
