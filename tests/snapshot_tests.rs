//! Snapshot pipeline tests: backend export → framed stream → restore on a
//! fresh replica, and corruption handling that leaves the target untouched.

mod support;

use support::{start_mock_backend, MockVectorStore};
use vectormesh::backend::BackendHandle;
use vectormesh::command::{Command, DistanceFunction};
use vectormesh::fsm::ReplicatedStateMachine;
use vectormesh::service::proto::SearchRequest;
use vectormesh::snapshot;

const SMALL_CHUNK: u32 = 64;

async fn fresh_fsm() -> (ReplicatedStateMachine, MockVectorStore) {
    let (addr, store, _task) = start_mock_backend().await;
    let backend = BackendHandle::connect_lazy(&addr).unwrap();
    (ReplicatedStateMachine::new(backend, SMALL_CHUNK), store)
}

async fn populate(fsm: &ReplicatedStateMachine) {
    fsm.apply(&Command::CreateCollection {
        collection_name: "users".into(),
        vector_dimension: 2,
        distance_function: DistanceFunction::Cosine,
        payload_table_schema: "create table users(rowid integer primary key, name text)".into(),
    })
    .await
    .unwrap();
    for id in 1..=3i64 {
        let response = fsm
            .apply(&Command::Insert {
                collection_name: "users".into(),
                id,
                vector: vec![id as f32, 1.0],
                payload_insert_query: format!("insert into users(name) values ('user-{id}')"),
            })
            .await
            .unwrap();
        assert!(response.success, "{}", response.message);
    }
}

fn probe() -> SearchRequest {
    SearchRequest {
        collection_name: "users".into(),
        vector: vec![1.0, 1.0],
        top_k: 10,
        payload_search_query: "select rowid, name from users".into(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_roundtrip_restores_indistinguishable_state() {
    let (source, source_store) = fresh_fsm().await;
    populate(&source).await;
    assert_eq!(source_store.point_count("users"), 3);

    let bytes = source.export_framed().await.unwrap();

    let (target, target_store) = fresh_fsm().await;
    assert_eq!(target_store.point_count("users"), 0);
    target.restore_framed(&bytes).await.unwrap();

    assert_eq!(target_store.collection_names(), vec!["users".to_string()]);
    assert_eq!(target_store.point_count("users"), 3);

    // Identical read responses on source and restored replica.
    let from_source = source.backend().search(probe()).await.unwrap();
    let from_target = target.backend().search(probe()).await.unwrap();
    assert_eq!(from_source, from_target);
    assert_eq!(from_source.results.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn truncated_stream_fails_and_preserves_target_state() {
    let (source, _source_store) = fresh_fsm().await;
    populate(&source).await;
    let bytes = source.export_framed().await.unwrap();

    // The target already holds different data.
    let (target, target_store) = fresh_fsm().await;
    target
        .apply(&Command::CreateCollection {
            collection_name: "other".into(),
            vector_dimension: 2,
            distance_function: DistanceFunction::Euclidean,
            payload_table_schema: "create table other(rowid integer primary key)".into(),
        })
        .await
        .unwrap();
    target
        .apply(&Command::Insert {
            collection_name: "other".into(),
            id: 9,
            vector: vec![0.0, 1.0],
            payload_insert_query: "insert into other default values".into(),
        })
        .await
        .unwrap();

    let err = target
        .restore_framed(&bytes[..bytes.len() - 1])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("corrupt"), "{err}");

    // Nothing reached the backend: pre-restore state is intact.
    assert_eq!(target_store.collection_names(), vec!["other".to_string()]);
    assert_eq!(target_store.point_count("other"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn export_produces_well_formed_multi_chunk_stream() {
    let (source, _store) = fresh_fsm().await;
    populate(&source).await;

    let bytes = source.export_framed().await.unwrap();
    let chunks = snapshot::read_frames(&bytes).unwrap();

    // A 64-byte chunk size over three points forces several data chunks.
    assert!(chunks.len() > 2, "only {} chunks", chunks.len());

    // Chunk 0 carries the metadata and nothing else does.
    let metadata = chunks[0].metadata.as_ref().unwrap();
    assert!(!metadata.snapshot_id.is_empty());
    assert!(!metadata.files.is_empty());
    assert!(chunks[1..].iter().all(|c| c.metadata.is_none()));

    // Contiguous sequencing with exactly one final chunk, in last place.
    snapshot::validate_sequence(&chunks).unwrap();
    let total: usize = chunks
        .iter()
        .filter_map(|c| c.file_chunk.as_ref())
        .map(|f| f.data.len())
        .sum();
    assert_eq!(total as u64, metadata.total_size);
}
