//! Node configuration parsed from environment variables.
//!
//! Each node is assigned a base port `P`; its consensus (Raft transport)
//! endpoint listens on `P*10 + 1` and its coordination (client-facing)
//! endpoint on `P*10 + 2`. Example: base `500` → consensus `5001`,
//! coordination `5002`. This convention is the sole mechanism by which a
//! node's coordination endpoint is derived from the Raft configuration, which
//! only records consensus addresses.
//!
//! | Variable | Default | Meaning |
//! |---------------------|------------------|------------------------------------------|
//! | `NODE_ID`           | `HOSTNAME`       | Stable string identity of this node      |
//! | `NODE_HOST`         | `127.0.0.1`      | Host both gRPC listeners bind/advertise  |
//! | `NODE_BASE_PORT`    | `500`            | Base port `P` for the port convention    |
//! | `DATA_DIR`          | `./data`         | Raft log, stable state, snapshots        |
//! | `BACKEND_ADDR`      | `127.0.0.1:6334` | Colocated vector store backend           |
//! | `BOOTSTRAP`         | `false`          | Initialize a single-node cluster         |
//! | `SEED_ADDRS`        | (empty)          | Coordination endpoints used for joining  |
//! | `HEALTH_ADDR`       | `0.0.0.0:8080`   | HTTP health/metrics listener             |
//! | `APPLY_TIMEOUT_MS`  | `5000`           | Deadline for a replicated write          |
//! | `MAX_REDIRECTS`     | `3`              | Client-side leader redirect hop budget   |
//! | `SNAPSHOT_CHUNK_SIZE` | `262144`       | Backend export chunk size in bytes       |

use std::path::PathBuf;
use std::time::Duration;

/// Default backend export chunk size: 256 KiB.
pub const DEFAULT_SNAPSHOT_CHUNK_SIZE: u32 = 256 * 1024;

/// Configuration for one proxy node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable string identity, chosen at first boot.
    pub node_id: String,

    /// Host for both gRPC listeners; also what peers and clients dial.
    pub host: String,

    /// Base port `P` of the port convention.
    pub base_port: u16,

    /// Directory holding `raft-log.db`, `raft-stable.db` and `snapshots/`.
    pub data_dir: PathBuf,

    /// Address of the colocated single-node vector store.
    pub backend_addr: String,

    /// When true and local state is empty, initialize a single-node cluster.
    pub bootstrap: bool,

    /// Coordination endpoints of existing cluster nodes, used for joining.
    pub seed_addrs: Vec<String>,

    /// HTTP health/metrics listener address.
    pub health_addr: String,

    /// Deadline for a replicated write to commit and apply locally.
    pub apply_timeout: Duration,

    /// Leader redirect hop budget for the embedded cluster client.
    pub max_redirects: usize,

    /// Chunk size requested from the backend's snapshot export.
    pub snapshot_chunk_size: u32,
}

impl NodeConfig {
    /// Parse node configuration from environment variables.
    pub fn from_env() -> Self {
        let node_id = std::env::var("NODE_ID").unwrap_or_else(|_| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-node".to_string())
        });

        let host = std::env::var("NODE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let base_port = std::env::var("NODE_BASE_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()));

        let backend_addr =
            std::env::var("BACKEND_ADDR").unwrap_or_else(|_| "127.0.0.1:6334".to_string());

        let bootstrap = std::env::var("BOOTSTRAP")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase()
            == "true";

        let seed_addrs = std::env::var("SEED_ADDRS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let health_addr =
            std::env::var("HEALTH_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let apply_timeout = std::env::var("APPLY_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        let max_redirects = std::env::var("MAX_REDIRECTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let snapshot_chunk_size = std::env::var("SNAPSHOT_CHUNK_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SNAPSHOT_CHUNK_SIZE);

        Self {
            node_id,
            host,
            base_port,
            data_dir,
            backend_addr,
            bootstrap,
            seed_addrs,
            health_addr,
            apply_timeout,
            max_redirects,
            snapshot_chunk_size,
        }
    }

    /// This node's Raft transport endpoint (`host:P*10+1`).
    pub fn consensus_addr(&self) -> String {
        format!("{}:{}", self.host, consensus_port(self.base_port))
    }

    /// This node's client-facing endpoint (`host:P*10+2`).
    pub fn coordination_addr(&self) -> String {
        format!("{}:{}", self.host, coordination_port(self.base_port))
    }

    /// Create a node config for testing purposes.
    pub fn for_testing() -> Self {
        Self {
            node_id: "test-node".to_string(),
            host: "127.0.0.1".to_string(),
            base_port: 500,
            data_dir: PathBuf::from("./data"),
            backend_addr: "127.0.0.1:6334".to_string(),
            bootstrap: false,
            seed_addrs: vec![],
            health_addr: "0.0.0.0:8080".to_string(),
            apply_timeout: Duration::from_secs(5),
            max_redirects: 3,
            snapshot_chunk_size: DEFAULT_SNAPSHOT_CHUNK_SIZE,
        }
    }
}

pub fn consensus_port(base_port: u16) -> u16 {
    base_port * 10 + 1
}

pub fn coordination_port(base_port: u16) -> u16 {
    base_port * 10 + 2
}

/// Derive a node's coordination endpoint from its consensus endpoint.
///
/// The Raft configuration records only consensus addresses; redirects and
/// cluster-info responses must hand clients something they can dial, so the
/// consensus port `P*10+1` is rewritten to the coordination port `P*10+2`.
/// Addresses that do not follow the convention are returned unchanged.
pub fn coordination_addr_from_consensus(consensus_addr: &str) -> String {
    match consensus_addr.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(p) if p % 10 == 1 => format!("{}:{}", host, p + 1),
            _ => consensus_addr.to_string(),
        },
        None => consensus_addr.to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
