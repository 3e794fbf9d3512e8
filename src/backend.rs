//! Client for the colocated vector-store backend.
//!
//! Every proxy node fronts exactly one single-node vector store, reached over
//! gRPC (typically on loopback). The handle is cheap to clone and safe for
//! concurrent use: the state machine applies committed commands through it
//! while read handlers query it in parallel; the backend serializes its own
//! internal writes.
//!
//! The channel dials lazily and reconnects automatically, so constructing a
//! handle never blocks on the backend being up.

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::debug;

use crate::command::DistanceFunction;
use crate::service::proto::vector_backend_client::VectorBackendClient;
use crate::service::proto::{
    CollectionExistsRequest, CreateCollectionRequest, DeleteRequest, DropCollectionRequest,
    ExportSnapshotRequest, InsertRequest, SearchReply, SearchRequest, SnapshotChunk,
};

/// Backend failure, discriminated so callers can tell idempotent-success
/// cases (duplicate id, absent target) from real trouble.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("backend unreachable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Internal(String),
}

impl From<Status> for BackendError {
    fn from(status: Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            Code::NotFound => BackendError::NotFound(msg),
            Code::AlreadyExists => BackendError::AlreadyExists(msg),
            Code::FailedPrecondition => BackendError::SchemaConflict(msg),
            Code::InvalidArgument => BackendError::InvalidArgument(msg),
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
                BackendError::Unavailable(msg)
            }
            _ => BackendError::Internal(msg),
        }
    }
}

impl BackendError {
    /// True for infrastructure failures where the data outcome is unknown.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Shared handle to the local backend.
#[derive(Clone)]
pub struct BackendHandle {
    addr: String,
    client: VectorBackendClient<Channel>,
}

impl BackendHandle {
    /// Create a handle to `addr`. The TCP dial happens on first use;
    /// tonic reconnects automatically on failure.
    pub fn connect_lazy(addr: &str) -> Result<Self, tonic::transport::Error> {
        let uri = if addr.starts_with("http") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let channel = Endpoint::from_shared(uri)?
            .connect_timeout(Duration::from_secs(3))
            .connect_lazy();
        Ok(Self {
            addr: addr.to_string(),
            client: VectorBackendClient::new(channel),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn client(&self) -> VectorBackendClient<Channel> {
        self.client.clone()
    }

    pub async fn create_collection(
        &self,
        collection_name: &str,
        vector_dimension: u32,
        distance_function: DistanceFunction,
        payload_table_schema: &str,
    ) -> Result<(), BackendError> {
        let reply = self
            .client()
            .create_collection(CreateCollectionRequest {
                collection_name: collection_name.to_string(),
                distance: distance_function.as_str().to_string(),
                vector_dimension: vector_dimension as i32,
                payload_table_schema: payload_table_schema.to_string(),
            })
            .await?
            .into_inner();
        if reply.success {
            Ok(())
        } else {
            Err(BackendError::Internal(reply.message))
        }
    }

    pub async fn insert(
        &self,
        collection_name: &str,
        id: i64,
        vector: Vec<f32>,
        payload_insert_query: &str,
    ) -> Result<(), BackendError> {
        let reply = self
            .client()
            .insert(InsertRequest {
                collection_name: collection_name.to_string(),
                id,
                vector,
                payload_insert_query: payload_insert_query.to_string(),
            })
            .await?
            .into_inner();
        if reply.success {
            Ok(())
        } else {
            Err(BackendError::Internal(reply.message))
        }
    }

    pub async fn delete(&self, collection_name: &str, id: i64) -> Result<(), BackendError> {
        let reply = self
            .client()
            .delete(DeleteRequest {
                collection_name: collection_name.to_string(),
                id,
            })
            .await?
            .into_inner();
        if reply.success {
            Ok(())
        } else {
            Err(BackendError::Internal(reply.message))
        }
    }

    pub async fn drop_collection(&self, collection_name: &str) -> Result<(), BackendError> {
        let reply = self
            .client()
            .drop_collection(DropCollectionRequest {
                collection_name: collection_name.to_string(),
            })
            .await?
            .into_inner();
        if reply.success {
            Ok(())
        } else {
            Err(BackendError::Internal(reply.message))
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchReply, BackendError> {
        Ok(self.client().search(request).await?.into_inner())
    }

    pub async fn collection_exists(&self, collection_name: &str) -> Result<bool, BackendError> {
        let reply = self
            .client()
            .collection_exists(CollectionExistsRequest {
                collection_name: collection_name.to_string(),
            })
            .await?
            .into_inner();
        Ok(reply.exists)
    }

    /// Collect the backend's full snapshot chunk stream, metadata chunk first.
    pub async fn export_snapshot(
        &self,
        chunk_size: u32,
    ) -> Result<Vec<SnapshotChunk>, BackendError> {
        let mut stream = self
            .client()
            .export_snapshot(ExportSnapshotRequest {
                chunk_size,
                include_index_files: true,
            })
            .await?
            .into_inner();

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.message().await? {
            let is_final = chunk.is_final;
            chunks.push(chunk);
            if is_final {
                break;
            }
        }
        debug!(chunks = chunks.len(), "Collected backend snapshot export");
        Ok(chunks)
    }

    /// Replay an exported chunk sequence into the backend, replacing its
    /// state. The chunks must be in export order.
    pub async fn import_snapshot(&self, chunks: Vec<SnapshotChunk>) -> Result<(), BackendError> {
        let count = chunks.len();
        let reply = self
            .client()
            .import_snapshot(tokio_stream::iter(chunks))
            .await?
            .into_inner();
        if reply.success {
            debug!(chunks = count, "Backend snapshot import complete");
            Ok(())
        } else {
            Err(BackendError::Internal(reply.message))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
