//! Consensus layer: one Raft participant per node.
//!
//! Wraps `openraft` (version 0.9) behind [`ConsensusNode`], the only surface
//! the rest of the system sees: submit a command, change membership, inspect
//! role and leadership. Leader election, log replication and snapshot
//! scheduling belong to the library; this module owns the composition.
//!
//! ## Transport
//!
//! openraft's `AppendEntries`, `Vote`, and `InstallSnapshot` requests are
//! JSON-serialized and carried in the `payload: bytes` field of the
//! `ConsensusTransport` gRPC service every node serves on its consensus
//! endpoint.
//!
//! ## Implementation note on async traits
//!
//! openraft uses RPITIT (return-position impl Trait in Trait) rather than
//! `async_trait::async_trait`. Implementations of its traits must use plain
//! `async fn` to match the expected signatures.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{
    ClientWriteError, InitializeError, InstallSnapshotError, RPCError, RaftError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::Adaptor;
use openraft::{AnyError, BasicNode, Entry, ServerState, SnapshotPolicy, TokioRuntime};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterHandle, ClusterStatus, NodeState};
use crate::command::{Command, CommandResponse};
use crate::config::{self, NodeConfig};
use crate::service::proto::consensus_transport_client::ConsensusTransportClient;
use crate::service::proto::{
    AppendEntriesRequest as ProtoAppendEntries, SnapshotRequest as ProtoSnapshot,
    VoteRequest as ProtoVote,
};
use crate::store::ClusterStore;

// ── Type configuration ────────────────────────────────────────────────────────

// The `declare_raft_types!` macro generates the TypeConfig struct and all
// required trait impls.
openraft::declare_raft_types!(
    pub TypeConfig:
        D            = Command,
        R            = CommandResponse,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

/// Derive a stable u64 node ID from the human-readable string identity.
pub fn node_id_from_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failures surfaced by [`ConsensusNode`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// This node is not the leader. Carries the leader's consensus address
    /// when the cluster has one, so callers can redirect.
    #[error("not the leader")]
    NotLeader {
        leader_consensus_addr: Option<String>,
    },

    /// The command was not committed and applied within the deadline. The
    /// outcome is unknown: it may still commit later.
    #[error("commit deadline exceeded; outcome unknown")]
    Timeout,

    /// The command committed but the local state machine reported an error.
    #[error("apply failed: {0}")]
    ApplyFailed(String),

    /// A membership change was rejected.
    #[error("membership change failed: {0}")]
    Membership(String),

    /// The Raft core is faulted or shut down.
    #[error("consensus core failure: {0}")]
    Fatal(String),
}

fn classify_write_error(
    err: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>,
) -> ConsensusError {
    match err {
        RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => ConsensusError::NotLeader {
            leader_consensus_addr: fwd.leader_node.map(|n| n.addr),
        },
        RaftError::APIError(ClientWriteError::ChangeMembershipError(e)) => {
            ConsensusError::Membership(e.to_string())
        }
        RaftError::Fatal(f) => ConsensusError::Fatal(f.to_string()),
    }
}

// ── Roles and membership views ────────────────────────────────────────────────

/// Externally visible role of a consensus participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Leader,
    Follower,
    Candidate,
    Shutdown,
}

/// One record of the committed cluster configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    pub id: NodeId,
    pub consensus_addr: String,
    pub is_voter: bool,
}

// ── gRPC network transport ────────────────────────────────────────────────────

/// Per-peer gRPC channel implementing openraft's `RaftNetwork`.
///
/// Serializes openraft request types as JSON and transports them via the
/// proto `payload: bytes` field of the `ConsensusTransport` service.
pub struct GrpcNetwork {
    target_addr: String,
    client: Option<ConsensusTransportClient<Channel>>,
}

impl GrpcNetwork {
    fn get_client(&mut self) -> Result<&mut ConsensusTransportClient<Channel>, String> {
        if self.client.is_none() {
            let uri = if self.target_addr.starts_with("http") {
                self.target_addr.clone()
            } else {
                format!("http://{}", self.target_addr)
            };
            // connect_lazy() returns immediately without a blocking TCP
            // handshake; tonic dials on the first RPC and reconnects
            // automatically. connect_timeout limits the handshake; timeout
            // limits each RPC so heartbeats fail fast instead of hanging
            // until a follower's election timer fires.
            let ch = Endpoint::from_shared(uri)
                .map_err(|e| e.to_string())?
                .connect_timeout(Duration::from_secs(3))
                .timeout(Duration::from_secs(4))
                .connect_lazy();
            self.client = Some(ConsensusTransportClient::new(ch));
        }
        Ok(self.client.as_mut().unwrap())
    }
}

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

impl RaftNetwork<TypeConfig> for GrpcNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let term = rpc.vote.leader_id().term;
        let leader = rpc.vote.leader_id().node_id.to_string();

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let proto_resp = client
            .append_entries(ProtoAppendEntries {
                term,
                leader_id: leader,
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let term = rpc.vote.leader_id().term;
        let candidate = rpc.vote.leader_id().node_id.to_string();

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let proto_resp = client
            .vote(ProtoVote {
                term,
                candidate_id: candidate,
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let term = rpc.vote.leader_id().term;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let proto_resp = client
            .install_snapshot(ProtoSnapshot { term, payload })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates `GrpcNetwork` instances per target peer node.
pub struct GrpcNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = GrpcNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        GrpcNetwork {
            target_addr: node.addr.clone(),
            client: None,
        }
    }
}

// ── ConsensusNode public API ──────────────────────────────────────────────────

/// One running Raft participant.
///
/// Everything the coordination service needs is here; the underlying
/// `openraft::Raft` handle stays private to this module apart from the
/// transport service, which feeds it peer RPCs.
#[derive(Clone)]
pub struct ConsensusNode {
    raft: Arc<RaftInstance>,
    pub node_id: NodeId,
    node_name: String,
    consensus_addr: String,
}

impl ConsensusNode {
    /// Submit a command to the replicated log. Resolves once the entry is
    /// committed and applied by the local state machine.
    ///
    /// `Timeout` leaves the outcome unknown — the command may still commit.
    /// Commands are effect-idempotent, so callers retry with the same id.
    pub async fn apply(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandResponse, ConsensusError> {
        match tokio::time::timeout(timeout, self.raft.client_write(command)).await {
            Err(_) => Err(ConsensusError::Timeout),
            Ok(Ok(resp)) => Ok(resp.data),
            Ok(Err(e)) => Err(classify_write_error(e)),
        }
    }

    /// Propose adding a full voting member. Leader-only.
    ///
    /// The node is first admitted as a learner so the leader can stream it a
    /// snapshot and the live log, then promoted to voter. Re-adding an
    /// existing voter is a no-op.
    pub async fn add_voter(
        &self,
        id: NodeId,
        consensus_addr: String,
        timeout: Duration,
    ) -> Result<(), ConsensusError> {
        let fut = async {
            let mut voters = self.voter_ids();
            if voters.contains(&id) {
                debug!(id, "Node is already a voter; add_voter is a no-op");
                return Ok(());
            }

            self.raft
                .add_learner(
                    id,
                    BasicNode {
                        addr: consensus_addr,
                    },
                    true,
                )
                .await
                .map_err(classify_write_error)?;

            voters.insert(id);
            self.raft
                .change_membership(voters, false)
                .await
                .map_err(classify_write_error)?;
            Ok(())
        };

        match tokio::time::timeout(timeout, fut).await {
            Err(_) => Err(ConsensusError::Timeout),
            Ok(res) => res,
        }
    }

    /// Propose removing a member. Leader-only; removing an unknown node is a
    /// no-op. Removing the current leader is refused — demote it first.
    pub async fn remove_server(&self, id: NodeId, timeout: Duration) -> Result<(), ConsensusError> {
        if self.raft.metrics().borrow().current_leader == Some(id) {
            return Err(ConsensusError::Membership(
                "cannot remove the current leader; transfer leadership first".to_string(),
            ));
        }

        let fut = async {
            let mut voters = self.voter_ids();
            if !voters.remove(&id) {
                debug!(id, "Node is not a member; remove_server is a no-op");
                return Ok(());
            }
            self.raft
                .change_membership(voters, false)
                .await
                .map_err(classify_write_error)?;
            Ok(())
        };

        match tokio::time::timeout(timeout, fut).await {
            Err(_) => Err(ConsensusError::Timeout),
            Ok(res) => res,
        }
    }

    /// Initialize a pristine single-node cluster containing only this node.
    /// Safe to call on an already-initialized node (idempotent no-op).
    pub async fn bootstrap(&self) -> Result<(), ConsensusError> {
        let mut members = BTreeMap::new();
        members.insert(
            self.node_id,
            BasicNode {
                addr: self.consensus_addr.clone(),
            },
        );
        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(node_id = self.node_id, "Bootstrapped single-node cluster");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                info!("Cluster already initialized (ignoring bootstrap on restart)");
                Ok(())
            }
            Err(e) => Err(ConsensusError::Membership(e.to_string())),
        }
    }

    /// Current role of this node.
    pub fn role(&self) -> RaftRole {
        match self.raft.metrics().borrow().state {
            ServerState::Leader => RaftRole::Leader,
            ServerState::Candidate => RaftRole::Candidate,
            ServerState::Shutdown => RaftRole::Shutdown,
            // A learner is a non-voting follower from the outside.
            _ => RaftRole::Follower,
        }
    }

    /// Consensus address of the current leader, when one is known.
    pub fn leader_consensus_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        let addr = metrics
            .membership_config
            .membership()
            .nodes()
            .find(|(id, _)| **id == leader)
            .map(|(_, node)| node.addr.clone());
        addr
    }

    /// Raft id of the current leader, when one is known.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// The currently committed cluster configuration.
    pub fn configuration(&self) -> Vec<MemberInfo> {
        let membership = self.raft.metrics().borrow().membership_config.clone();
        let voters: BTreeSet<NodeId> = membership.membership().voter_ids().collect();
        membership
            .membership()
            .nodes()
            .map(|(id, node)| MemberInfo {
                id: *id,
                consensus_addr: node.addr.clone(),
                is_voter: voters.contains(id),
            })
            .collect()
    }

    fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Handle for the transport service to feed peer RPCs into.
    pub fn raft(&self) -> &RaftInstance {
        &self.raft
    }

    /// Graceful, idempotent stop of the consensus core.
    pub async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            debug!(error = %e, "Raft core already stopped");
        }
    }
}

// ── Startup ───────────────────────────────────────────────────────────────────

/// Build and start the consensus participant for this node.
///
/// Spawns a background task watching `Raft::metrics()` that keeps the
/// [`ClusterHandle`] in sync (role, leader coordination address, term,
/// applied index).
pub async fn start_consensus_node(
    config: &NodeConfig,
    store: ClusterStore,
    handle: ClusterHandle,
) -> Result<Arc<ConsensusNode>, ConsensusError> {
    let node_id = node_id_from_str(&config.node_id);
    let consensus_addr = config.consensus_addr();

    let raft_config = Arc::new(
        openraft::Config {
            cluster_name: "vectormesh".to_string(),
            heartbeat_interval: 300,
            election_timeout_min: 1500,
            election_timeout_max: 3000,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(1000),
            ..Default::default()
        }
        .validate()
        .expect("valid openraft config"),
    );

    let (log_store, state_machine) = Adaptor::new(store);

    let raft = Arc::new(
        openraft::Raft::new(
            node_id,
            raft_config,
            GrpcNetworkFactory,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ConsensusError::Fatal(e.to_string()))?,
    );

    let node = Arc::new(ConsensusNode {
        raft: raft.clone(),
        node_id,
        node_name: config.node_id.clone(),
        consensus_addr,
    });

    // Watch Raft state → update ClusterHandle.
    {
        let mut rx = raft.metrics();
        let h = handle.clone();
        tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    h.update(ClusterStatus {
                        state: NodeState::Shutdown,
                        ..h.status()
                    });
                    break;
                }
                let m = rx.borrow().clone();
                let state = match m.state {
                    ServerState::Leader => NodeState::Leader,
                    ServerState::Follower | ServerState::Learner => NodeState::Follower,
                    ServerState::Candidate => NodeState::Forming,
                    _ => NodeState::Shutdown,
                };
                let leader_addr = m.current_leader.and_then(|leader| {
                    m.membership_config
                        .membership()
                        .nodes()
                        .find(|(id, _)| **id == leader)
                        .map(|(_, n)| config::coordination_addr_from_consensus(&n.addr))
                });
                h.update(ClusterStatus {
                    state,
                    leader_addr,
                    term: m.current_term,
                    last_applied: m.last_applied.map(|log_id| log_id.index),
                });
            }
            warn!("Raft metrics stream closed");
        });
    }

    info!(
        node_id,
        node_name = %config.node_id,
        consensus_addr = %config.consensus_addr(),
        "Consensus node started"
    );

    Ok(node)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_deterministic() {
        assert_eq!(node_id_from_str("node-1"), node_id_from_str("node-1"));
    }

    #[test]
    fn different_node_ids_differ() {
        assert_ne!(node_id_from_str("node-1"), node_id_from_str("node-2"));
    }

    #[test]
    fn not_leader_carries_forward_address() {
        use openraft::error::ForwardToLeader;
        let err: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>> =
            RaftError::APIError(ClientWriteError::ForwardToLeader(ForwardToLeader {
                leader_id: Some(7),
                leader_node: Some(BasicNode {
                    addr: "10.0.0.7:5001".to_string(),
                }),
            }));
        match classify_write_error(err) {
            ConsensusError::NotLeader {
                leader_consensus_addr,
            } => assert_eq!(leader_consensus_addr.as_deref(), Some("10.0.0.7:5001")),
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }

    #[test]
    fn forward_without_leader_yields_empty_address() {
        use openraft::error::ForwardToLeader;
        let err: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>> =
            RaftError::APIError(ClientWriteError::ForwardToLeader(ForwardToLeader {
                leader_id: None,
                leader_node: None,
            }));
        match classify_write_error(err) {
            ConsensusError::NotLeader {
                leader_consensus_addr,
            } => assert!(leader_consensus_addr.is_none()),
            other => panic!("expected NotLeader, got {other:?}"),
        }
    }
}
