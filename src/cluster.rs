//! Shared node state and the operational HTTP listener.
//!
//! The [`ClusterHandle`] is a cheap-to-clone view of this node's Raft role,
//! kept in sync by a background task watching the consensus metrics stream.
//! The coordination service, the redirect filter and the health endpoint all
//! read it without touching the Raft core.
//!
//! ## Health check states
//!
//! | State    | Meaning                                            |
//! |----------|----------------------------------------------------|
//! | forming  | Started, not yet a member of a quorum              |
//! | follower | Replicating from the current leader                |
//! | leader   | Elected leader — accepts writes directly           |
//! | shutdown | Consensus core stopped; node requires a restart    |

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, TextEncoder};
use tracing::{error, info};

use crate::config::NodeConfig;

// ── Node state ────────────────────────────────────────────────────────────────

/// The externally visible Raft role of this node.
///
/// Candidate rounds are transient and surface as `Forming`; the redirect
/// filter consults the consensus layer directly for the finer-grained role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    /// Started, waiting for membership or a first election.
    Forming,
    /// Replicating as a Raft follower (or learner catching up).
    Follower,
    /// Elected Raft leader.
    Leader,
    /// Consensus core has stopped.
    Shutdown,
}

impl NodeState {
    /// Lowercase string used in health responses and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Forming => "forming",
            NodeState::Follower => "follower",
            NodeState::Leader => "leader",
            NodeState::Shutdown => "shutdown",
        }
    }
}

/// Point-in-time view of this node's cluster status.
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub state: NodeState,
    /// Coordination endpoint of the current leader, when known.
    pub leader_addr: Option<String>,
    pub term: u64,
    pub last_applied: Option<u64>,
}

impl Default for ClusterStatus {
    fn default() -> Self {
        Self {
            state: NodeState::Forming,
            leader_addr: None,
            term: 0,
            last_applied: None,
        }
    }
}

// ── Cluster handle ────────────────────────────────────────────────────────────

/// Shared cluster state handle — cheap to clone, safe to share across tasks.
#[derive(Clone)]
pub struct ClusterHandle {
    status: Arc<Mutex<ClusterStatus>>,
    config: NodeConfig,
}

impl ClusterHandle {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            status: Arc::new(Mutex::new(ClusterStatus::default())),
            config,
        }
    }

    pub fn state(&self) -> NodeState {
        self.status.lock().unwrap().state.clone()
    }

    pub fn status(&self) -> ClusterStatus {
        self.status.lock().unwrap().clone()
    }

    /// Replace the status snapshot. Called by the consensus metrics watcher;
    /// state transitions are logged once, here.
    pub fn update(&self, new: ClusterStatus) {
        let old_state = {
            let mut guard = self.status.lock().unwrap();
            let old = guard.state.clone();
            *guard = new.clone();
            old
        };
        if old_state != new.state {
            info!(
                node_id = %self.config.node_id,
                old_state = old_state.as_str(),
                new_state = new.state.as_str(),
                term = new.term,
                leader = ?new.leader_addr,
                "Cluster node state changed"
            );
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}

// ── Health server ─────────────────────────────────────────────────────────────

/// JSON body returned by `GET /health/cluster`.
#[derive(Debug, serde::Serialize)]
struct HealthBody {
    state: String,
    node_id: String,
    is_leader: bool,
    leader_addr: Option<String>,
    term: u64,
    last_applied: Option<u64>,
}

async fn health_handler(
    req: Request<Body>,
    handle: ClusterHandle,
) -> Result<Response<Body>, hyper::Error> {
    match req.uri().path() {
        "/health/cluster" => {
            let status = handle.status();
            let body = HealthBody {
                state: status.state.as_str().to_string(),
                node_id: handle.config().node_id.clone(),
                is_leader: status.state == NodeState::Leader,
                leader_addr: status.leader_addr,
                term: status.term,
                last_applied: status.last_applied,
            };
            let body = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
            Ok(Response::builder()
                .status(200)
                .header("Content-Type", "application/json")
                .body(Body::from(body))
                .unwrap())
        }
        "/metrics" => {
            let encoder = TextEncoder::new();
            let metric_families = prometheus::default_registry().gather();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                error!(error = %e, "Failed to encode metrics");
            }
            Ok(Response::builder()
                .status(200)
                .header("Content-Type", encoder.format_type())
                .body(Body::from(buffer))
                .unwrap())
        }
        _ => Ok(Response::builder()
            .status(404)
            .body(Body::from("not found"))
            .unwrap()),
    }
}

/// Starts the health/metrics HTTP server.
///
/// Serves `GET /health/cluster` (JSON node status) and `GET /metrics`
/// (Prometheus text format). Runs indefinitely; spawn in a background task.
pub async fn start_health_server(handle: ClusterHandle) {
    let addr: SocketAddr = handle
        .config()
        .health_addr
        .parse()
        .unwrap_or_else(|_| ([0, 0, 0, 0], 8080).into());

    let make_svc = make_service_fn(move |_conn| {
        let handle_clone = handle.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let handle_inner = handle_clone.clone();
                async move { health_handler(req, handle_inner).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(addr = %addr, "Health endpoint started — GET /health/cluster, GET /metrics");

    if let Err(e) = server.await {
        error!(error = %e, "Health server error");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_forming() {
        let handle = ClusterHandle::new(NodeConfig::for_testing());
        assert_eq!(handle.state(), NodeState::Forming);
        assert!(handle.status().leader_addr.is_none());
    }

    #[test]
    fn update_replaces_status() {
        let handle = ClusterHandle::new(NodeConfig::for_testing());
        handle.update(ClusterStatus {
            state: NodeState::Leader,
            leader_addr: Some("127.0.0.1:5002".into()),
            term: 3,
            last_applied: Some(17),
        });
        let status = handle.status();
        assert_eq!(status.state, NodeState::Leader);
        assert_eq!(status.leader_addr.as_deref(), Some("127.0.0.1:5002"));
        assert_eq!(status.term, 3);
        assert_eq!(status.last_applied, Some(17));
    }

    #[test]
    fn handle_clone_shares_state() {
        let handle1 = ClusterHandle::new(NodeConfig::for_testing());
        let handle2 = handle1.clone();
        handle1.update(ClusterStatus {
            state: NodeState::Follower,
            ..ClusterStatus::default()
        });
        assert_eq!(handle2.state(), NodeState::Follower);
    }

    #[test]
    fn node_state_strings() {
        assert_eq!(NodeState::Forming.as_str(), "forming");
        assert_eq!(NodeState::Follower.as_str(), "follower");
        assert_eq!(NodeState::Leader.as_str(), "leader");
        assert_eq!(NodeState::Shutdown.as_str(), "shutdown");
    }
}
