//! Server-side enforcement of leader-only write semantics.
//!
//! Every coordination RPC is classified by method name. Writes and
//! membership changes on a non-leader node are short-circuited before any
//! handler logic runs: if the leader is known, the response is
//! `FAILED_PRECONDITION` with `x-redirect: true` and `x-leader-addr` set to
//! the leader's *coordination* endpoint (derived from its consensus address
//! by the port convention); with no known leader the response is
//! `UNAVAILABLE` and carries no redirect metadata. Reads and introspection
//! always pass through.
//!
//! The filter never mutates requests and never performs consensus
//! operations itself.

use std::sync::Arc;

use tonic::metadata::MetadataValue;
use tonic::Status;

use crate::config::coordination_addr_from_consensus;
use crate::metrics;
use crate::raft::{ConsensusNode, RaftRole};

/// Metadata key flagging a structured leader redirect.
pub const REDIRECT_METADATA_KEY: &str = "x-redirect";

/// Metadata key carrying the leader's coordination endpoint.
pub const LEADER_ADDR_METADATA_KEY: &str = "x-leader-addr";

// ── Classification ────────────────────────────────────────────────────────────

/// Coordination RPC classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcClass {
    /// Replicated mutation — leader-only.
    Write,
    /// Cluster membership change — leader-only.
    Membership,
    /// Served from the local replica on any node.
    Read,
    /// Cluster metadata — any node.
    Introspective,
}

/// Classify a coordination method by name.
///
/// Unknown names classify as `Write` so nothing new can bypass the leader
/// gate by omission.
pub fn classify(method: &str) -> RpcClass {
    match method {
        "CreateCollection" | "Insert" | "Delete" | "DropCollection" => RpcClass::Write,
        "JoinCluster" | "LeaveCluster" => RpcClass::Membership,
        "Search" | "CollectionExists" => RpcClass::Read,
        "GetClusterInfo" => RpcClass::Introspective,
        _ => RpcClass::Write,
    }
}

// ── Leadership view ───────────────────────────────────────────────────────────

/// The slice of consensus state the filter needs. Split out so the filter
/// can be exercised without a running Raft core.
pub trait LeadershipView: Send + Sync {
    fn role(&self) -> RaftRole;
    fn leader_consensus_addr(&self) -> Option<String>;
}

impl LeadershipView for ConsensusNode {
    fn role(&self) -> RaftRole {
        ConsensusNode::role(self)
    }

    fn leader_consensus_addr(&self) -> Option<String> {
        ConsensusNode::leader_consensus_addr(self)
    }
}

// ── Filter ────────────────────────────────────────────────────────────────────

/// Single-point guard the coordination handlers call before any work.
#[derive(Clone)]
pub struct LeaderRedirectFilter {
    view: Arc<dyn LeadershipView>,
}

impl LeaderRedirectFilter {
    pub fn new(view: Arc<dyn LeadershipView>) -> Self {
        Self { view }
    }

    /// Gate `method`. `Err` is the final response for this RPC; no handler
    /// logic may run after it.
    pub fn check(&self, method: &str) -> Result<(), Status> {
        match classify(method) {
            RpcClass::Read | RpcClass::Introspective => Ok(()),
            RpcClass::Write | RpcClass::Membership => self.ensure_leader(),
        }
    }

    fn ensure_leader(&self) -> Result<(), Status> {
        match self.view.role() {
            RaftRole::Leader => Ok(()),
            RaftRole::Follower => match self.view.leader_consensus_addr() {
                Some(addr) => Err(redirect_status(&addr)),
                None => Err(Status::unavailable("no known leader; retry later")),
            },
            RaftRole::Candidate => Err(Status::unavailable(
                "leader election in progress; retry later",
            )),
            RaftRole::Shutdown => Err(Status::unavailable("node is shut down")),
        }
    }
}

/// Build the structured redirect response for a known leader.
///
/// `leader_consensus_addr` is what Raft knows; clients are handed the
/// derived coordination endpoint.
pub fn redirect_status(leader_consensus_addr: &str) -> Status {
    let coordination_addr = coordination_addr_from_consensus(leader_consensus_addr);
    let mut status = Status::failed_precondition(format!(
        "not the leader; leader coordination endpoint is {coordination_addr}"
    ));
    let metadata = status.metadata_mut();
    metadata.insert(
        REDIRECT_METADATA_KEY,
        MetadataValue::from_static("true"),
    );
    if let Ok(value) = MetadataValue::try_from(coordination_addr.as_str()) {
        metadata.insert(LEADER_ADDR_METADATA_KEY, value);
    }
    metrics::REDIRECTS_ISSUED.inc();
    status
}

// ── Tests ─────────────────────────────────────────────────────────────────────
