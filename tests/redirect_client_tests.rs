//! Client redirect-loop tests against stub coordination services: a
//! redirect chain ending at an accepting leader, a redirect cycle that
//! exhausts the hop budget, and non-redirect errors passing through.

mod support;

use std::time::Duration;

use tonic::transport::Server;
use tonic::{Request, Response, Status};

use support::next_base_port;
use vectormesh::client::{ClientError, ClusterClient};
use vectormesh::config::{consensus_port, coordination_port};
use vectormesh::redirect::redirect_status;
use vectormesh::service::proto::coordination_server::{Coordination, CoordinationServer};
use vectormesh::service::proto::*;

/// What the stub does with leader-only calls.
#[derive(Clone)]
enum Mode {
    /// Answer with a structured redirect naming this consensus address.
    RedirectTo(String),
    /// Accept the write.
    Accept,
    /// Fail with FAILED_PRECONDITION but no redirect metadata.
    Reject,
}

#[derive(Clone)]
struct StubCoordination {
    mode: Mode,
}

impl StubCoordination {
    fn write_outcome(&self) -> Result<Response<MutationReply>, Status> {
        match &self.mode {
            Mode::RedirectTo(consensus_addr) => Err(redirect_status(consensus_addr)),
            Mode::Accept => Ok(Response::new(MutationReply {
                success: true,
                message: "accepted".into(),
            })),
            Mode::Reject => Err(Status::failed_precondition("rejected without redirect")),
        }
    }
}

#[tonic::async_trait]
impl Coordination for StubCoordination {
    async fn create_collection(
        &self,
        _req: Request<CreateCollectionRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        self.write_outcome()
    }

    async fn insert(
        &self,
        _req: Request<InsertRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        self.write_outcome()
    }

    async fn delete(
        &self,
        _req: Request<DeleteRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        self.write_outcome()
    }

    async fn drop_collection(
        &self,
        _req: Request<DropCollectionRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        self.write_outcome()
    }

    async fn search(&self, _req: Request<SearchRequest>) -> Result<Response<SearchReply>, Status> {
        Err(Status::unimplemented("stub"))
    }

    async fn collection_exists(
        &self,
        _req: Request<CollectionExistsRequest>,
    ) -> Result<Response<CollectionExistsReply>, Status> {
        Err(Status::unimplemented("stub"))
    }

    async fn get_cluster_info(
        &self,
        _req: Request<ClusterInfoRequest>,
    ) -> Result<Response<ClusterInfoReply>, Status> {
        Err(Status::unimplemented("stub"))
    }

    async fn join_cluster(
        &self,
        _req: Request<JoinRequest>,
    ) -> Result<Response<JoinReply>, Status> {
        Err(Status::unimplemented("stub"))
    }

    async fn leave_cluster(
        &self,
        _req: Request<LeaveRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        self.write_outcome()
    }
}

async fn serve_stub(base_port: u16, mode: Mode) {
    let addr = format!("127.0.0.1:{}", coordination_port(base_port))
        .parse()
        .unwrap();
    tokio::spawn(async move {
        let _ = Server::builder()
            .add_service(CoordinationServer::new(StubCoordination { mode }))
            .serve(addr)
            .await;
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
}

fn coordination_addr(base_port: u16) -> String {
    format!("127.0.0.1:{}", coordination_port(base_port))
}

fn consensus_addr(base_port: u16) -> String {
    format!("127.0.0.1:{}", consensus_port(base_port))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_follows_redirect_to_accepting_leader() {
    let follower_port = next_base_port();
    let leader_port = next_base_port();

    // The follower advertises the leader's consensus address; the client
    // must end up dialing the derived coordination endpoint.
    serve_stub(follower_port, Mode::RedirectTo(consensus_addr(leader_port))).await;
    serve_stub(leader_port, Mode::Accept).await;

    let client = ClusterClient::with_defaults(vec![coordination_addr(follower_port)]);
    let reply = client
        .insert("users", 1, vec![1.0, 2.0], "insert into users default values")
        .await
        .unwrap();
    assert!(reply.success);

    // The leader is now preferred: the next call succeeds without touching
    // the follower again (single hop chain stays within budget trivially).
    let reply = client.delete("users", 1).await.unwrap();
    assert!(reply.success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redirect_cycle_exhausts_hop_budget() {
    let port = next_base_port();
    // The stub names itself as leader, creating a redirect cycle.
    serve_stub(port, Mode::RedirectTo(consensus_addr(port))).await;

    let client = ClusterClient::new(vec![coordination_addr(port)], 3);
    match client
        .insert("users", 1, vec![1.0], "insert into users default values")
        .await
    {
        Err(ClientError::MaxRedirectsExceeded(3)) => {}
        other => panic!("expected MaxRedirectsExceeded(3), got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_redirect_errors_propagate_unchanged() {
    let port = next_base_port();
    serve_stub(port, Mode::Reject).await;

    let client = ClusterClient::with_defaults(vec![coordination_addr(port)]);
    match client
        .insert("users", 1, vec![1.0], "insert into users default values")
        .await
    {
        Err(ClientError::Rpc(status)) => {
            assert_eq!(status.code(), tonic::Code::FailedPrecondition);
            assert!(status.metadata().get("x-redirect").is_none());
        }
        other => panic!("expected the raw RPC error, got {other:?}"),
    }
}
