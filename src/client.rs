//! Cluster client: one dial address, leader changes hidden.
//!
//! The client is configured with one or more seed coordination endpoints.
//! Every unary call runs through the redirect loop: when a non-leader node
//! answers `FAILED_PRECONDITION` with `x-redirect: true` and a non-empty
//! `x-leader-addr`, the call is transparently retried against the advertised
//! leader, up to a bounded hop count. Non-redirect errors propagate
//! unchanged; exhausting the hop budget surfaces
//! [`ClientError::MaxRedirectsExceeded`].
//!
//! Connections are pooled per address and created lazily. Lookup is
//! read-dominant: an optimistic read-lock probe, upgraded to a write lock
//! only on a miss, so steady-state dispatch takes no exclusive lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Response, Status};
use tracing::debug;

use crate::redirect::{LEADER_ADDR_METADATA_KEY, REDIRECT_METADATA_KEY};
use crate::service::proto::coordination_client::CoordinationClient;
use crate::service::proto::{
    ClusterInfoReply, ClusterInfoRequest, CollectionExistsRequest, CreateCollectionRequest,
    DeleteRequest, DropCollectionRequest, InsertRequest, JoinReply, JoinRequest, LeaveRequest,
    MutationReply, SearchReply, SearchRequest,
};

/// Default redirect hop budget per user-visible call.
pub const DEFAULT_MAX_REDIRECTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no seed addresses configured")]
    NoSeeds,

    #[error("redirect hop budget of {0} exhausted without reaching the leader")]
    MaxRedirectsExceeded(usize),

    #[error("invalid address {addr}: {message}")]
    InvalidAddress { addr: String, message: String },

    #[error(transparent)]
    Rpc(#[from] Status),
}

/// Extract the redirect target from a failed call, if the failure is a
/// structured leader redirect.
fn redirect_target(status: &Status) -> Option<String> {
    if status.code() != Code::FailedPrecondition {
        return None;
    }
    let metadata = status.metadata();
    let flagged = metadata
        .get(REDIRECT_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
        == Some("true");
    if !flagged {
        return None;
    }
    metadata
        .get(LEADER_ADDR_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|addr| !addr.is_empty())
        .map(String::from)
}

/// Client runtime for the coordination service.
pub struct ClusterClient {
    seeds: Vec<String>,
    max_redirects: usize,
    pool: Arc<RwLock<HashMap<String, CoordinationClient<Channel>>>>,
    /// Last address that answered a write — usually the leader. A latency
    /// optimization only; the redirect loop is what guarantees delivery.
    preferred: Mutex<Option<String>>,
}

impl ClusterClient {
    pub fn new(seeds: Vec<String>, max_redirects: usize) -> Self {
        Self {
            seeds,
            max_redirects,
            pool: Arc::new(RwLock::new(HashMap::new())),
            preferred: Mutex::new(None),
        }
    }

    pub fn with_defaults(seeds: Vec<String>) -> Self {
        Self::new(seeds, DEFAULT_MAX_REDIRECTS)
    }

    /// Get or lazily create the pooled connection for `addr`.
    fn connection(&self, addr: &str) -> Result<CoordinationClient<Channel>, ClientError> {
        if let Some(client) = self.pool.read().unwrap().get(addr) {
            return Ok(client.clone());
        }

        let uri = if addr.starts_with("http") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| ClientError::InvalidAddress {
                addr: addr.to_string(),
                message: e.to_string(),
            })?
            .connect_timeout(Duration::from_secs(3))
            .connect_lazy();
        let client = CoordinationClient::new(channel);

        let mut pool = self.pool.write().unwrap();
        Ok(pool.entry(addr.to_string()).or_insert(client).clone())
    }

    /// Drop all pooled connections.
    pub fn close(&self) {
        self.pool.write().unwrap().clear();
        *self.preferred.lock().unwrap() = None;
    }

    fn starting_addr(&self) -> Result<String, ClientError> {
        if let Some(addr) = self.preferred.lock().unwrap().clone() {
            return Ok(addr);
        }
        self.seeds.first().cloned().ok_or(ClientError::NoSeeds)
    }

    /// Run `op` with transparent leader-redirect retries.
    async fn call_with_redirects<T, F, Fut>(&self, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut(CoordinationClient<Channel>) -> Fut,
        Fut: Future<Output = Result<Response<T>, Status>>,
    {
        let mut addr = self.starting_addr()?;
        let mut hops = 0usize;

        loop {
            let client = self.connection(&addr)?;
            match op(client).await {
                Ok(resp) => {
                    *self.preferred.lock().unwrap() = Some(addr);
                    return Ok(resp.into_inner());
                }
                Err(status) => match redirect_target(&status) {
                    Some(leader_addr) => {
                        if hops >= self.max_redirects {
                            return Err(ClientError::MaxRedirectsExceeded(self.max_redirects));
                        }
                        hops += 1;
                        debug!(
                            from = %addr,
                            to = %leader_addr,
                            hop = hops,
                            "Following leader redirect"
                        );
                        addr = leader_addr;
                    }
                    None => return Err(ClientError::Rpc(status)),
                },
            }
        }
    }

    // ── Coordination surface ──────────────────────────────────────────────

    pub async fn create_collection(
        &self,
        collection_name: &str,
        distance: &str,
        vector_dimension: i32,
        payload_table_schema: &str,
    ) -> Result<MutationReply, ClientError> {
        let request = CreateCollectionRequest {
            collection_name: collection_name.to_string(),
            distance: distance.to_string(),
            vector_dimension,
            payload_table_schema: payload_table_schema.to_string(),
        };
        self.call_with_redirects(move |mut client| {
            let request = request.clone();
            async move { client.create_collection(request).await }
        })
        .await
    }

    pub async fn insert(
        &self,
        collection_name: &str,
        id: i64,
        vector: Vec<f32>,
        payload_insert_query: &str,
    ) -> Result<MutationReply, ClientError> {
        let request = InsertRequest {
            collection_name: collection_name.to_string(),
            id,
            vector,
            payload_insert_query: payload_insert_query.to_string(),
        };
        self.call_with_redirects(move |mut client| {
            let request = request.clone();
            async move { client.insert(request).await }
        })
        .await
    }

    pub async fn delete(&self, collection_name: &str, id: i64) -> Result<MutationReply, ClientError> {
        let request = DeleteRequest {
            collection_name: collection_name.to_string(),
            id,
        };
        self.call_with_redirects(move |mut client| {
            let request = request.clone();
            async move { client.delete(request).await }
        })
        .await
    }

    pub async fn drop_collection(
        &self,
        collection_name: &str,
    ) -> Result<MutationReply, ClientError> {
        let request = DropCollectionRequest {
            collection_name: collection_name.to_string(),
        };
        self.call_with_redirects(move |mut client| {
            let request = request.clone();
            async move { client.drop_collection(request).await }
        })
        .await
    }

    pub async fn search(
        &self,
        collection_name: &str,
        vector: Vec<f32>,
        top_k: i32,
        payload_search_query: &str,
    ) -> Result<SearchReply, ClientError> {
        let request = SearchRequest {
            collection_name: collection_name.to_string(),
            vector,
            top_k,
            payload_search_query: payload_search_query.to_string(),
        };
        self.call_with_redirects(move |mut client| {
            let request = request.clone();
            async move { client.search(request).await }
        })
        .await
    }

    /// Search served by a specific node, bypassing the preferred-address
    /// stickiness. Reads are valid on any replica.
    pub async fn search_on(
        &self,
        addr: &str,
        collection_name: &str,
        vector: Vec<f32>,
        top_k: i32,
        payload_search_query: &str,
    ) -> Result<SearchReply, ClientError> {
        let mut client = self.connection(addr)?;
        let reply = client
            .search(SearchRequest {
                collection_name: collection_name.to_string(),
                vector,
                top_k,
                payload_search_query: payload_search_query.to_string(),
            })
            .await?;
        Ok(reply.into_inner())
    }

    pub async fn collection_exists(&self, collection_name: &str) -> Result<bool, ClientError> {
        let request = CollectionExistsRequest {
            collection_name: collection_name.to_string(),
        };
        let reply = self
            .call_with_redirects(move |mut client| {
                let request = request.clone();
                async move { client.collection_exists(request).await }
            })
            .await?;
        Ok(reply.exists)
    }

    pub async fn get_cluster_info(&self) -> Result<ClusterInfoReply, ClientError> {
        self.call_with_redirects(move |mut client| async move {
            client.get_cluster_info(ClusterInfoRequest {}).await
        })
        .await
    }

    /// Cluster info as seen by one specific node.
    pub async fn get_cluster_info_from(
        &self,
        addr: &str,
    ) -> Result<ClusterInfoReply, ClientError> {
        let mut client = self.connection(addr)?;
        let reply = client.get_cluster_info(ClusterInfoRequest {}).await?;
        Ok(reply.into_inner())
    }

    pub async fn join_cluster(
        &self,
        node_id: &str,
        node_addr: &str,
    ) -> Result<JoinReply, ClientError> {
        let request = JoinRequest {
            node_id: node_id.to_string(),
            node_addr: node_addr.to_string(),
        };
        self.call_with_redirects(move |mut client| {
            let request = request.clone();
            async move { client.join_cluster(request).await }
        })
        .await
    }

    pub async fn leave_cluster(&self, node_id: &str) -> Result<MutationReply, ClientError> {
        let request = LeaveRequest {
            node_id: node_id.to_string(),
        };
        self.call_with_redirects(move |mut client| {
            let request = request.clone();
            async move { client.leave_cluster(request).await }
        })
        .await
    }

    /// Ask the seeds who the leader is and prefer it for subsequent calls.
    ///
    /// A latency optimization: the redirect loop alone is sufficient for
    /// correctness.
    pub async fn discover_leader(&self) -> Result<Option<String>, ClientError> {
        for seed in &self.seeds {
            match self.get_cluster_info_from(seed).await {
                Ok(info) if !info.leader_addr.is_empty() => {
                    *self.preferred.lock().unwrap() = Some(info.leader_addr.clone());
                    return Ok(Some(info.leader_addr));
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!(seed = %seed, error = %e, "Seed unavailable during discovery");
                    continue;
                }
            }
        }
        Ok(None)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
