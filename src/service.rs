//! gRPC services served by every node.
//!
//! Two listeners per node:
//!
//! - the **consensus** endpoint (`P*10+1`) carries the `ConsensusTransport`
//!   service: peer Raft traffic, opaque to everything but the Raft core;
//! - the **coordination** endpoint (`P*10+2`) carries the `Coordination`
//!   service: client writes, reads, membership and cluster introspection.
//!
//! Writes are validated, gated by the [`LeaderRedirectFilter`], serialized
//! into a [`Command`] and submitted to consensus; the reply reports the local
//! state machine's apply result. Reads go straight to the colocated backend
//! and reflect whatever log prefix this node has applied.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::backend::{BackendError, BackendHandle};
use crate::command::{
    self, Command, ValidationError,
};
use crate::config::coordination_addr_from_consensus;
use crate::fsm::ReplicatedStateMachine;
use crate::raft::{node_id_from_str, ConsensusError, ConsensusNode, RaftRole, TypeConfig};
use crate::redirect::{self, LeaderRedirectFilter};

/// Generated protobuf types and gRPC service stubs.
///
/// Shared across the codebase:
/// - `proto::SnapshotChunk` and friends are the backend snapshot stream
///   (`snapshot` codec, `backend` client)
/// - `proto::AppendEntriesRequest` / `VoteRequest` / `SnapshotRequest` carry
///   Raft traffic (`raft` transport)
/// - the `Coordination` messages are the client surface (`client` runtime)
pub mod proto {
    tonic::include_proto!("vectormesh");
}

use proto::consensus_transport_server::{ConsensusTransport, ConsensusTransportServer};
use proto::coordination_server::{Coordination, CoordinationServer};
use proto::*;

/// Deadline for membership changes; admitting a node includes streaming it a
/// snapshot, which dwarfs the write deadline.
const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(30);

// ── Status mapping ────────────────────────────────────────────────────────────

fn validation_to_status(err: ValidationError) -> Status {
    Status::invalid_argument(err.to_string())
}

pub(crate) fn consensus_error_to_status(err: ConsensusError) -> Status {
    match err {
        ConsensusError::NotLeader {
            leader_consensus_addr: Some(addr),
        } => redirect::redirect_status(&addr),
        ConsensusError::NotLeader {
            leader_consensus_addr: None,
        } => Status::unavailable("no known leader; retry later"),
        ConsensusError::Timeout => {
            Status::deadline_exceeded("commit outcome unknown; retry with the same id")
        }
        ConsensusError::Membership(msg) => Status::failed_precondition(msg),
        ConsensusError::ApplyFailed(msg) | ConsensusError::Fatal(msg) => Status::internal(msg),
    }
}

pub(crate) fn backend_error_to_status(err: BackendError) -> Status {
    match err {
        BackendError::NotFound(msg) => Status::not_found(msg),
        BackendError::AlreadyExists(msg) => Status::already_exists(msg),
        BackendError::SchemaConflict(msg) => Status::failed_precondition(msg),
        BackendError::InvalidArgument(msg) => Status::invalid_argument(msg),
        BackendError::Unavailable(msg) => Status::unavailable(msg),
        BackendError::Internal(msg) => Status::internal(msg),
    }
}

// ── Coordination service ──────────────────────────────────────────────────────

/// Server-side implementation of the `Coordination` gRPC service.
#[derive(Clone)]
pub struct CoordinationService {
    consensus: Arc<ConsensusNode>,
    fsm: ReplicatedStateMachine,
    filter: LeaderRedirectFilter,
    apply_timeout: Duration,
}

impl CoordinationService {
    pub fn new(
        consensus: Arc<ConsensusNode>,
        fsm: ReplicatedStateMachine,
        apply_timeout: Duration,
    ) -> Self {
        let filter = LeaderRedirectFilter::new(consensus.clone());
        Self {
            consensus,
            fsm,
            filter,
            apply_timeout,
        }
    }

    fn backend(&self) -> &BackendHandle {
        self.fsm.backend()
    }

    /// Serialize a validated command into the replicated log and report the
    /// local apply result.
    async fn propose(&self, command: Command) -> Result<Response<MutationReply>, Status> {
        match self.consensus.apply(command, self.apply_timeout).await {
            Ok(applied) => Ok(Response::new(MutationReply {
                success: applied.success,
                message: applied.message,
            })),
            Err(e) => Err(consensus_error_to_status(e)),
        }
    }
}

#[tonic::async_trait]
impl Coordination for CoordinationService {
    // ── Writes ────────────────────────────────────────────────────────────

    async fn create_collection(
        &self,
        req: Request<CreateCollectionRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        self.filter.check("CreateCollection")?;
        let req = req.into_inner();
        let (distance_function, vector_dimension) = command::validate_create_collection(
            &req.collection_name,
            &req.distance,
            req.vector_dimension,
        )
        .map_err(validation_to_status)?;

        self.propose(Command::CreateCollection {
            collection_name: req.collection_name,
            vector_dimension,
            distance_function,
            payload_table_schema: req.payload_table_schema,
        })
        .await
    }

    async fn insert(
        &self,
        req: Request<InsertRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        self.filter.check("Insert")?;
        let req = req.into_inner();
        let expected = self.fsm.collection_dimension(&req.collection_name);
        command::validate_insert(&req.collection_name, &req.vector, expected)
            .map_err(validation_to_status)?;

        self.propose(Command::Insert {
            collection_name: req.collection_name,
            id: req.id,
            vector: req.vector,
            payload_insert_query: req.payload_insert_query,
        })
        .await
    }

    async fn delete(
        &self,
        req: Request<DeleteRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        self.filter.check("Delete")?;
        let req = req.into_inner();
        command::validate_collection_name(&req.collection_name).map_err(validation_to_status)?;

        self.propose(Command::Delete {
            collection_name: req.collection_name,
            id: req.id,
        })
        .await
    }

    async fn drop_collection(
        &self,
        req: Request<DropCollectionRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        self.filter.check("DropCollection")?;
        let req = req.into_inner();
        command::validate_collection_name(&req.collection_name).map_err(validation_to_status)?;

        self.propose(Command::DropCollection {
            collection_name: req.collection_name,
        })
        .await
    }

    // ── Reads — local replica, no consensus ───────────────────────────────

    async fn search(&self, req: Request<SearchRequest>) -> Result<Response<SearchReply>, Status> {
        self.filter.check("Search")?;
        let req = req.into_inner();
        command::validate_search(&req.collection_name, &req.vector, req.top_k)
            .map_err(validation_to_status)?;

        let reply = self
            .backend()
            .search(req)
            .await
            .map_err(backend_error_to_status)?;
        Ok(Response::new(reply))
    }

    async fn collection_exists(
        &self,
        req: Request<CollectionExistsRequest>,
    ) -> Result<Response<CollectionExistsReply>, Status> {
        self.filter.check("CollectionExists")?;
        let req = req.into_inner();
        command::validate_collection_name(&req.collection_name).map_err(validation_to_status)?;

        let exists = self
            .backend()
            .collection_exists(&req.collection_name)
            .await
            .map_err(backend_error_to_status)?;
        Ok(Response::new(CollectionExistsReply { exists }))
    }

    // ── Introspection ─────────────────────────────────────────────────────

    async fn get_cluster_info(
        &self,
        _req: Request<ClusterInfoRequest>,
    ) -> Result<Response<ClusterInfoReply>, Status> {
        self.filter.check("GetClusterInfo")?;

        let leader_id = self.consensus.leader_id();
        let leader_addr = self
            .consensus
            .leader_consensus_addr()
            .map(|addr| coordination_addr_from_consensus(&addr))
            .unwrap_or_default();

        let state = match self.consensus.role() {
            RaftRole::Leader => "leader",
            RaftRole::Follower => "follower",
            RaftRole::Candidate => "candidate",
            RaftRole::Shutdown => "shutdown",
        };

        let nodes = self
            .consensus
            .configuration()
            .into_iter()
            .map(|member| {
                let node_state = if Some(member.id) == leader_id {
                    "leader"
                } else {
                    "follower"
                };
                NodeInfo {
                    node_id: member.id.to_string(),
                    addr: member.consensus_addr,
                    state: node_state.to_string(),
                    is_voter: member.is_voter,
                }
            })
            .collect();

        Ok(Response::new(ClusterInfoReply {
            leader_id: leader_id.map(|id| id.to_string()).unwrap_or_default(),
            leader_addr,
            state: state.to_string(),
            nodes,
        }))
    }

    // ── Membership ────────────────────────────────────────────────────────

    async fn join_cluster(
        &self,
        req: Request<JoinRequest>,
    ) -> Result<Response<JoinReply>, Status> {
        self.filter.check("JoinCluster")?;
        let req = req.into_inner();
        if req.node_id.trim().is_empty() || req.node_addr.trim().is_empty() {
            return Err(Status::invalid_argument(
                "node_id and node_addr must not be empty",
            ));
        }

        let id = node_id_from_str(&req.node_id);
        info!(
            node_id = %req.node_id,
            raft_id = id,
            addr = %req.node_addr,
            "Admitting node to the cluster"
        );

        match self
            .consensus
            .add_voter(id, req.node_addr, MEMBERSHIP_TIMEOUT)
            .await
        {
            Ok(()) => Ok(Response::new(JoinReply {
                success: true,
                message: format!("node {} is a voter", req.node_id),
                leader_id: self.consensus.node_id.to_string(),
            })),
            Err(e) => Err(consensus_error_to_status(e)),
        }
    }

    async fn leave_cluster(
        &self,
        req: Request<LeaveRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        self.filter.check("LeaveCluster")?;
        let req = req.into_inner();
        if req.node_id.trim().is_empty() {
            return Err(Status::invalid_argument("node_id must not be empty"));
        }

        let id = node_id_from_str(&req.node_id);
        info!(node_id = %req.node_id, raft_id = id, "Removing node from the cluster");

        match self.consensus.remove_server(id, MEMBERSHIP_TIMEOUT).await {
            Ok(()) => Ok(Response::new(MutationReply {
                success: true,
                message: format!("node {} removed", req.node_id),
            })),
            Err(e) => Err(consensus_error_to_status(e)),
        }
    }
}

// ── Consensus transport service ───────────────────────────────────────────────

/// Server-side implementation of the `ConsensusTransport` gRPC service.
///
/// Each RPC deserializes the proto `payload` bytes back into the openraft
/// request type and forwards it to the local Raft core.
#[derive(Clone)]
pub struct ConsensusTransportService {
    consensus: Arc<ConsensusNode>,
}

impl ConsensusTransportService {
    pub fn new(consensus: Arc<ConsensusNode>) -> Self {
        Self { consensus }
    }
}

#[tonic::async_trait]
impl ConsensusTransport for ConsensusTransportService {
    async fn append_entries(
        &self,
        req: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let payload = req.into_inner().payload;
        let raft_req: openraft::raft::AppendEntriesRequest<TypeConfig> =
            serde_json::from_slice(&payload).map_err(|e| {
                Status::invalid_argument(format!("failed to decode AppendEntriesRequest: {}", e))
            })?;

        let resp = self
            .consensus
            .raft()
            .append_entries(raft_req)
            .await
            .map_err(|e| Status::internal(format!("Raft AppendEntries error: {}", e)))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))?;

        Ok(Response::new(AppendEntriesResponse {
            success: true,
            payload,
        }))
    }

    async fn vote(&self, req: Request<VoteRequest>) -> Result<Response<VoteResponse>, Status> {
        let payload = req.into_inner().payload;
        let raft_req: openraft::raft::VoteRequest<crate::raft::NodeId> =
            serde_json::from_slice(&payload).map_err(|e| {
                Status::invalid_argument(format!("failed to decode VoteRequest: {}", e))
            })?;

        let resp = self
            .consensus
            .raft()
            .vote(raft_req)
            .await
            .map_err(|e| Status::internal(format!("Raft Vote error: {}", e)))?;

        let vote_granted = resp.vote_granted;
        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))?;

        Ok(Response::new(VoteResponse {
            vote_granted,
            payload,
        }))
    }

    async fn install_snapshot(
        &self,
        req: Request<SnapshotRequest>,
    ) -> Result<Response<SnapshotResponse>, Status> {
        let payload = req.into_inner().payload;
        let raft_req: openraft::raft::InstallSnapshotRequest<TypeConfig> =
            serde_json::from_slice(&payload).map_err(|e| {
                Status::invalid_argument(format!("failed to decode InstallSnapshotRequest: {}", e))
            })?;

        let resp = self
            .consensus
            .raft()
            .install_snapshot(raft_req)
            .await
            .map_err(|e| Status::internal(format!("Raft InstallSnapshot error: {}", e)))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))?;

        Ok(Response::new(SnapshotResponse { payload }))
    }
}

// ── Server startup ────────────────────────────────────────────────────────────

fn parse_bind_addr(addr: &str, default_port: u16) -> SocketAddr {
    addr.parse().unwrap_or_else(|_| {
        warn!(addr, "Unparseable bind address, falling back to 0.0.0.0");
        ([0, 0, 0, 0], default_port).into()
    })
}

/// Serve the Raft transport on the consensus endpoint. Runs indefinitely;
/// spawn in a background task.
pub async fn start_consensus_server(consensus: Arc<ConsensusNode>, bind_addr: String) {
    let addr = parse_bind_addr(&bind_addr, 5001);
    info!(addr = %addr, "Consensus transport server starting");

    if let Err(e) = Server::builder()
        .add_service(ConsensusTransportServer::new(ConsensusTransportService::new(consensus)))
        .serve(addr)
        .await
    {
        error!(error = %e, "Consensus transport server error");
    }
}

/// Serve the client-facing coordination service. Runs indefinitely; spawn in
/// a background task.
pub async fn start_coordination_server(service: CoordinationService, bind_addr: String) {
    let addr = parse_bind_addr(&bind_addr, 5002);
    info!(addr = %addr, "Coordination server starting");

    if let Err(e) = Server::builder()
        .add_service(CoordinationServer::new(service))
        .serve(addr)
        .await
    {
        error!(error = %e, "Coordination server error");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
