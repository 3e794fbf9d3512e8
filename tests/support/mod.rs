//! Shared test harness: an in-process mock vector backend honoring the
//! backend status-code contract, plus full-node bootstrap helpers.
//!
//! Each test binary compiles its own copy and uses a different slice of it.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use vectormesh::backend::BackendHandle;
use vectormesh::cluster::ClusterHandle;
use vectormesh::config::{consensus_port, coordination_port, NodeConfig};
use vectormesh::fsm::ReplicatedStateMachine;
use vectormesh::raft::{start_consensus_node, ConsensusNode};
use vectormesh::service::proto::vector_backend_server::{VectorBackend, VectorBackendServer};
use vectormesh::service::proto::{
    CollectionExistsReply, CollectionExistsRequest, CreateCollectionRequest, DeleteRequest,
    DropCollectionRequest, ExportSnapshotRequest, FileChunk, FileType, InsertRequest,
    MutationReply, PayloadField, SearchReply, SearchRequest, SearchResult, SnapshotChunk,
    SnapshotFile, SnapshotMetadata,
};
use vectormesh::service::{self, CoordinationService};
use vectormesh::store::ClusterStore;

// ── Mock vector store ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StoredPoint {
    vector: Vec<f32>,
    payload_query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StoredCollection {
    dimension: u32,
    distance: String,
    schema: String,
    points: BTreeMap<i64, StoredPoint>,
}

/// Deterministic in-memory stand-in for the single-node vector store. Error
/// discrimination follows the backend contract: ALREADY_EXISTS for duplicate
/// collections/ids, NOT_FOUND for absent targets, FAILED_PRECONDITION for
/// schema conflicts, INVALID_ARGUMENT for dimension mismatches.
#[derive(Clone, Default)]
pub struct MockVectorStore {
    state: Arc<Mutex<BTreeMap<String, StoredCollection>>>,
    export_counter: Arc<AtomicU64>,
}

impl MockVectorStore {
    pub fn collection_names(&self) -> Vec<String> {
        self.state.lock().unwrap().keys().cloned().collect()
    }

    pub fn point_count(&self, collection: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .get(collection)
            .map(|c| c.points.len())
            .unwrap_or(0)
    }
}

fn pairwise_distance(metric: &str, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match metric {
        "Euclidean" => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
        "InnerProduct" => -dot,
        // Cosine distance.
        _ => {
            let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if na == 0.0 || nb == 0.0 {
                1.0
            } else {
                1.0 - dot / (na * nb)
            }
        }
    }
}

#[tonic::async_trait]
impl VectorBackend for MockVectorStore {
    async fn create_collection(
        &self,
        req: Request<CreateCollectionRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        let req = req.into_inner();
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.get(&req.collection_name) {
            let identical = existing.dimension == req.vector_dimension as u32
                && existing.distance == req.distance
                && existing.schema == req.payload_table_schema;
            return if identical {
                Err(Status::already_exists(format!(
                    "collection {} already exists",
                    req.collection_name
                )))
            } else {
                Err(Status::failed_precondition(format!(
                    "schema conflict for collection {}",
                    req.collection_name
                )))
            };
        }
        state.insert(
            req.collection_name,
            StoredCollection {
                dimension: req.vector_dimension as u32,
                distance: req.distance,
                schema: req.payload_table_schema,
                points: BTreeMap::new(),
            },
        );
        Ok(Response::new(MutationReply {
            success: true,
            message: "created".into(),
        }))
    }

    async fn insert(
        &self,
        req: Request<InsertRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        let req = req.into_inner();
        let mut state = self.state.lock().unwrap();
        let collection = state
            .get_mut(&req.collection_name)
            .ok_or_else(|| Status::not_found(format!("collection {}", req.collection_name)))?;
        if req.vector.len() != collection.dimension as usize {
            return Err(Status::invalid_argument(format!(
                "dimension mismatch: vector has {} dimensions, collection expects {}",
                req.vector.len(),
                collection.dimension
            )));
        }
        if collection.points.contains_key(&req.id) {
            return Err(Status::already_exists(format!("id {}", req.id)));
        }
        collection.points.insert(
            req.id,
            StoredPoint {
                vector: req.vector,
                payload_query: req.payload_insert_query,
            },
        );
        Ok(Response::new(MutationReply {
            success: true,
            message: "inserted".into(),
        }))
    }

    async fn delete(&self, req: Request<DeleteRequest>) -> Result<Response<MutationReply>, Status> {
        let req = req.into_inner();
        let mut state = self.state.lock().unwrap();
        let collection = state
            .get_mut(&req.collection_name)
            .ok_or_else(|| Status::not_found(format!("collection {}", req.collection_name)))?;
        if collection.points.remove(&req.id).is_none() {
            return Err(Status::not_found(format!("id {}", req.id)));
        }
        Ok(Response::new(MutationReply {
            success: true,
            message: "deleted".into(),
        }))
    }

    async fn drop_collection(
        &self,
        req: Request<DropCollectionRequest>,
    ) -> Result<Response<MutationReply>, Status> {
        let req = req.into_inner();
        let mut state = self.state.lock().unwrap();
        if state.remove(&req.collection_name).is_none() {
            return Err(Status::not_found(format!(
                "collection {}",
                req.collection_name
            )));
        }
        Ok(Response::new(MutationReply {
            success: true,
            message: "dropped".into(),
        }))
    }

    async fn search(&self, req: Request<SearchRequest>) -> Result<Response<SearchReply>, Status> {
        let req = req.into_inner();
        let state = self.state.lock().unwrap();
        let collection = state
            .get(&req.collection_name)
            .ok_or_else(|| Status::not_found(format!("collection {}", req.collection_name)))?;

        let mut scored: Vec<SearchResult> = collection
            .points
            .iter()
            .map(|(id, point)| SearchResult {
                rowid: *id,
                distance: pairwise_distance(&collection.distance, &req.vector, &point.vector),
                payload: vec![PayloadField {
                    key: "query".into(),
                    value: point.payload_query.clone(),
                }],
            })
            .collect();
        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.rowid.cmp(&b.rowid))
        });
        scored.truncate(req.top_k.max(0) as usize);
        Ok(Response::new(SearchReply { results: scored }))
    }

    async fn collection_exists(
        &self,
        req: Request<CollectionExistsRequest>,
    ) -> Result<Response<CollectionExistsReply>, Status> {
        let req = req.into_inner();
        let exists = self.state.lock().unwrap().contains_key(&req.collection_name);
        Ok(Response::new(CollectionExistsReply { exists }))
    }

    type ExportSnapshotStream =
        tokio_stream::Iter<std::vec::IntoIter<Result<SnapshotChunk, Status>>>;

    async fn export_snapshot(
        &self,
        req: Request<ExportSnapshotRequest>,
    ) -> Result<Response<Self::ExportSnapshotStream>, Status> {
        let req = req.into_inner();
        let chunk_size = req.chunk_size.max(1) as usize;
        let bytes = {
            let state = self.state.lock().unwrap();
            serde_json::to_vec(&*state)
                .map_err(|e| Status::internal(format!("export serialization: {e}")))?
        };
        let export_id = self.export_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let mut chunks = vec![SnapshotChunk {
            metadata: Some(SnapshotMetadata {
                snapshot_id: format!("mock-{export_id}"),
                created_at: 1_700_000_000,
                total_size: bytes.len() as u64,
                version: "1".into(),
                checksum: format!("{:08x}", crc32(&bytes)),
                files: vec![SnapshotFile {
                    file_name: "store.db".into(),
                    file_type: FileType::SqliteDb as i32,
                    file_size: bytes.len() as u64,
                    checksum: format!("{:08x}", crc32(&bytes)),
                }],
            }),
            file_chunk: None,
            sequence: 0,
            is_final: false,
        }];

        let pieces: Vec<&[u8]> = if bytes.is_empty() {
            vec![&bytes[..]]
        } else {
            bytes.chunks(chunk_size).collect()
        };
        let last = pieces.len() - 1;
        for (i, piece) in pieces.iter().enumerate() {
            chunks.push(SnapshotChunk {
                metadata: None,
                file_chunk: Some(FileChunk {
                    file_name: "store.db".into(),
                    offset: (i * chunk_size) as u64,
                    data: piece.to_vec(),
                    is_last_chunk: i == last,
                }),
                sequence: (i + 1) as u64,
                is_final: i == last,
            });
        }

        let results: Vec<Result<SnapshotChunk, Status>> = chunks.into_iter().map(Ok).collect();
        Ok(Response::new(tokio_stream::iter(results)))
    }

    async fn import_snapshot(
        &self,
        req: Request<Streaming<SnapshotChunk>>,
    ) -> Result<Response<MutationReply>, Status> {
        let mut stream = req.into_inner();
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.message().await? {
            if let Some(file_chunk) = chunk.file_chunk {
                bytes.extend_from_slice(&file_chunk.data);
            }
            if chunk.is_final {
                break;
            }
        }
        let imported: BTreeMap<String, StoredCollection> = serde_json::from_slice(&bytes)
            .map_err(|e| Status::invalid_argument(format!("import decode: {e}")))?;
        *self.state.lock().unwrap() = imported;
        Ok(Response::new(MutationReply {
            success: true,
            message: "imported".into(),
        }))
    }
}

// Small local CRC so the harness does not depend on the crate's internals.
fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for byte in bytes {
        crc ^= *byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

/// Serve a fresh mock backend on an ephemeral loopback port.
pub async fn start_mock_backend() -> (String, MockVectorStore, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let store = MockVectorStore::default();
    let service = store.clone();
    let task = tokio::spawn(async move {
        let _ = Server::builder()
            .add_service(VectorBackendServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });
    (format!("127.0.0.1:{}", addr.port()), store, task)
}

// ── Node harness ──────────────────────────────────────────────────────────────

// Base ports are handed out sequentially so concurrently running tests do
// not collide on the derived consensus/coordination ports.
static NEXT_BASE_PORT: AtomicU16 = AtomicU16::new(710);

pub fn next_base_port() -> u16 {
    NEXT_BASE_PORT.fetch_add(1, Ordering::SeqCst)
}

pub struct TestNode {
    pub config: NodeConfig,
    pub consensus: Arc<ConsensusNode>,
    pub fsm: ReplicatedStateMachine,
    pub backend_store: MockVectorStore,
    tasks: Vec<JoinHandle<()>>,
    _data_dir: tempfile::TempDir,
}

impl TestNode {
    pub fn coordination_addr(&self) -> String {
        self.config.coordination_addr()
    }

    pub fn consensus_addr(&self) -> String {
        self.config.consensus_addr()
    }

    pub async fn stop(self) {
        self.consensus.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Boot a full node (mock backend, store on a temp dir, consensus core, both
/// gRPC servers), mirroring the binary's wiring.
pub async fn start_node(node_id: &str, base_port: u16, bootstrap: bool) -> TestNode {
    let (backend_addr, backend_store, backend_task) = start_mock_backend().await;
    let data_dir = tempfile::tempdir().unwrap();

    let mut config = NodeConfig::for_testing();
    config.node_id = node_id.to_string();
    config.base_port = base_port;
    config.data_dir = data_dir.path().to_path_buf();
    config.backend_addr = backend_addr;
    config.bootstrap = bootstrap;

    let backend = BackendHandle::connect_lazy(&config.backend_addr).unwrap();
    let fsm = ReplicatedStateMachine::new(backend, config.snapshot_chunk_size);
    let store = ClusterStore::open(&config.data_dir, fsm.clone()).unwrap();
    let handle = ClusterHandle::new(config.clone());
    let consensus = start_consensus_node(&config, store, handle)
        .await
        .unwrap();

    let mut tasks = vec![backend_task];
    tasks.push(tokio::spawn(service::start_consensus_server(
        consensus.clone(),
        format!("127.0.0.1:{}", consensus_port(base_port)),
    )));
    tasks.push(tokio::spawn(service::start_coordination_server(
        CoordinationService::new(consensus.clone(), fsm.clone(), config.apply_timeout),
        format!("127.0.0.1:{}", coordination_port(base_port)),
    )));

    // Let the listeners come up before anything dials them.
    tokio::time::sleep(Duration::from_millis(150)).await;

    if bootstrap {
        consensus.bootstrap().await.unwrap();
    }

    TestNode {
        config,
        consensus,
        fsm,
        backend_store,
        tasks,
        _data_dir: data_dir,
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_for<F>(what: &str, timeout: Duration, mut cond: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Wait until the node reports itself leader.
pub async fn wait_for_leader(node: &TestNode) {
    let consensus = node.consensus.clone();
    wait_for(
        "leader election",
        Duration::from_secs(15),
        move || consensus.is_leader(),
    )
    .await;
}
