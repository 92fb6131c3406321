//! Static cluster configuration and compile-time tunables.
//!
//! The cluster map is identical on every node and is loaded once at startup
//! from a TOML file; `Tunables` mirrors the original system's compile-time
//! constants but is made overridable for experimentation.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FatalError;

/// A single peer's static network and RDMA identity, as exchanged at
/// bootstrap time (§6 of the design).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub ip: Ipv4Addr,
    pub id: u16,
    pub tcp_port: u16,
    pub ib_port: u16,
    pub gid_index: u16,
}

/// Cluster-wide configuration, identical on every node except `host_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node's rank.
    pub host_id: u16,
    /// Index into the local host's list of RDMA devices.
    #[serde(default)]
    pub rdma_device: u8,
    /// All nodes, in rank order.
    pub nodes: Vec<NodeConfig>,
    /// Tunable knobs; defaults match the reference design.
    #[serde(default)]
    pub tunables: Tunables,
}

impl ClusterConfig {
    /// Loads and validates a cluster configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FatalError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FatalError::Config(format!("reading {}: {e}", path.display())))?;
        let cfg: ClusterConfig =
            toml::from_str(&text).map_err(|e| FatalError::Config(format!("parsing {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), FatalError> {
        let n = self.nodes.len();
        if n == 0 {
            return Err(FatalError::Config("cluster must have at least one node".into()));
        }
        if n > 64 {
            return Err(FatalError::Config("cluster must have at most 64 nodes".into()));
        }
        if self.host_id as usize >= n {
            return Err(FatalError::Config(format!(
                "host_id {} out of range for {n} nodes",
                self.host_id
            )));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.id as usize != i {
                return Err(FatalError::Config(format!(
                    "nodes must be listed in rank order: entry {i} has id {}",
                    node.id
                )));
            }
        }
        Ok(())
    }

    /// Number of nodes in the cluster.
    #[must_use]
    pub fn n(&self) -> usize {
        self.nodes.len()
    }
}

/// Compile-time-equivalent tunables, collected for runtime overridability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Maximum number of slots in the shared slot array.
    pub max_slots: u64,
    /// Size of the per-node, per-thread results scratch buffer.
    pub max_concurrent_req: usize,
    /// Rank of the node owning the authoritative frontier.
    pub frontier_node: u16,
    /// Rank of the node arbitrating LL/SC recoveries.
    pub coordinator_node: u16,
    /// Bounded retry count for indeterminate rounds.
    pub max_retries: u32,
    /// Spin iterations before an LL/SC recovery request times out.
    pub recovery_spin_iters: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_slots: 1_000_000,
            max_concurrent_req: 64,
            frontier_node: 0,
            coordinator_node: 0,
            max_retries: 5,
            recovery_spin_iters: 10_000_000,
        }
    }
}

/// Fast quorum size: `ceil(3N/4)`.
#[must_use]
pub fn fast_quorum(n: usize) -> usize {
    (n * 3 + 3) / 4
}

/// Classic (majority) quorum size: `floor(N/2) + 1`.
#[must_use]
pub fn classic_quorum(n: usize) -> usize {
    n / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_formulas_match_spec_examples() {
        assert_eq!(fast_quorum(3), 3);
        assert_eq!(classic_quorum(3), 2);
        assert_eq!(fast_quorum(4), 3);
        assert_eq!(classic_quorum(4), 3);
        assert_eq!(fast_quorum(7), 6);
        assert_eq!(classic_quorum(7), 4);
    }

    #[test]
    fn rejects_out_of_range_host_id() {
        let cfg = ClusterConfig {
            host_id: 5,
            rdma_device: 0,
            nodes: vec![NodeConfig {
                ip: Ipv4Addr::new(127, 0, 0, 1),
                id: 0,
                tcp_port: 8888,
                ib_port: 1,
                gid_index: 0,
            }],
            tunables: Tunables::default(),
        };
        assert!(cfg.validate().is_err());
    }
}
