//! The deterministic state machine fed by committed log entries.
//!
//! Every node applies the same commands in the same order to its colocated
//! backend, so all replicas converge. Apply outcomes fall into three classes:
//!
//! - **Success**, including the idempotent cases: re-creating a collection
//!   the backend already has, inserting a duplicate id, deleting an absent
//!   point, dropping an absent collection. Retries after an ambiguous commit
//!   must not produce a second effect.
//! - **Deterministic rejection** (bad payload query, dimension mismatch that
//!   slipped past validation): reported to the originating caller as
//!   `success = false`. Every replica rejects identically, so the replicas
//!   still converge; the entry stays applied.
//! - **Fatal**: the backend is unreachable, or reports a state that
//!   contradicts the log (schema conflict on create). Continuing would let
//!   this replica silently diverge, so the error is returned as a storage
//!   error and the consensus core shuts the node down.
//!
//! The consensus layer invokes `apply` serially in log order; `apply`,
//! snapshot building and restore are mutually exclusive on a node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use openraft::{AnyError, ErrorSubject, ErrorVerb, StorageError, StorageIOError};
use tracing::{error, info, warn};

use crate::backend::{BackendError, BackendHandle};
use crate::command::{Command, CommandResponse, DistanceFunction};
use crate::metrics;
use crate::raft::NodeId;
use crate::snapshot;

/// Declared shape of a collection, tracked for pre-consensus validation.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMeta {
    pub vector_dimension: u32,
    pub distance_function: DistanceFunction,
}

/// Applies committed commands to the local backend and moves whole-state
/// snapshots in and out of it.
#[derive(Clone)]
pub struct ReplicatedStateMachine {
    backend: BackendHandle,
    snapshot_chunk_size: u32,
    /// Collections this node has applied, for local validation. Best-effort:
    /// collections restored via snapshot are unknown here and their dimension
    /// checks fall through to the backend.
    collections: Arc<Mutex<HashMap<String, CollectionMeta>>>,
}

impl ReplicatedStateMachine {
    pub fn new(backend: BackendHandle, snapshot_chunk_size: u32) -> Self {
        Self {
            backend,
            snapshot_chunk_size,
            collections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    /// Declared dimension of `collection`, when this node has applied its
    /// creation.
    pub fn collection_dimension(&self, collection: &str) -> Option<u32> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map(|meta| meta.vector_dimension)
    }

    /// Apply one committed command to the backend.
    ///
    /// An `Err` here is fatal for the node: the consensus core treats storage
    /// errors as unrecoverable and shuts down rather than diverge.
    pub async fn apply(&self, command: &Command) -> Result<CommandResponse, StorageError<NodeId>> {
        let response = match command {
            Command::CreateCollection {
                collection_name,
                vector_dimension,
                distance_function,
                payload_table_schema,
            } => {
                let result = self
                    .backend
                    .create_collection(
                        collection_name,
                        *vector_dimension,
                        *distance_function,
                        payload_table_schema,
                    )
                    .await;
                match result {
                    Ok(()) => {
                        self.remember_collection(collection_name, *vector_dimension, *distance_function);
                        CommandResponse::ok(format!("collection {collection_name} created"))
                    }
                    // The backend already has this collection with an
                    // identical schema — a replayed command after a snapshot
                    // or an ambiguous-commit retry. Applied means applied.
                    Err(BackendError::AlreadyExists(_)) => {
                        self.remember_collection(collection_name, *vector_dimension, *distance_function);
                        CommandResponse::ok(format!("collection {collection_name} already exists"))
                    }
                    // An existing collection with a different schema means
                    // this replica's state contradicts the log.
                    Err(BackendError::SchemaConflict(msg)) => {
                        error!(
                            collection = %collection_name,
                            message = %msg,
                            "Divergent collection schema on committed CreateCollection; halting"
                        );
                        return Err(divergence_error(command, &msg));
                    }
                    Err(e) => self.classify_backend_error(command, e)?,
                }
            }

            Command::Insert {
                collection_name,
                id,
                vector,
                payload_insert_query,
            } => {
                let result = self
                    .backend
                    .insert(collection_name, *id, vector.clone(), payload_insert_query)
                    .await;
                match result {
                    Ok(()) => CommandResponse::ok(format!("inserted {id}")),
                    Err(BackendError::AlreadyExists(_)) => {
                        CommandResponse::ok(format!("id {id} already present"))
                    }
                    Err(e) => self.classify_backend_error(command, e)?,
                }
            }

            Command::Delete {
                collection_name,
                id,
            } => {
                let result = self.backend.delete(collection_name, *id).await;
                match result {
                    Ok(()) => CommandResponse::ok(format!("deleted {id}")),
                    Err(BackendError::NotFound(_)) => {
                        CommandResponse::ok(format!("id {id} not present"))
                    }
                    Err(e) => self.classify_backend_error(command, e)?,
                }
            }

            Command::DropCollection { collection_name } => {
                let result = self.backend.drop_collection(collection_name).await;
                match result {
                    Ok(()) | Err(BackendError::NotFound(_)) => {
                        self.collections.lock().unwrap().remove(collection_name);
                        CommandResponse::ok(format!("collection {collection_name} dropped"))
                    }
                    Err(e) => self.classify_backend_error(command, e)?,
                }
            }
        };

        metrics::COMMANDS_APPLIED
            .with_label_values(&[command.kind()])
            .inc();
        Ok(response)
    }

    /// Export the backend's full state and frame it for the Raft snapshot
    /// store.
    pub async fn export_framed(&self) -> Result<Vec<u8>, StorageError<NodeId>> {
        let chunks = self
            .backend
            .export_snapshot(self.snapshot_chunk_size)
            .await
            .map_err(|e| {
                StorageError::IO {
                    source: StorageIOError::new(
                        ErrorSubject::Snapshot(None),
                        ErrorVerb::Read,
                        AnyError::error(format!("backend snapshot export failed: {e}")),
                    ),
                }
            })?;

        let bytes = snapshot::write_frames(&chunks).map_err(|e| StorageError::IO {
            source: StorageIOError::new(
                ErrorSubject::Snapshot(None),
                ErrorVerb::Write,
                AnyError::error(format!("snapshot framing failed: {e}")),
            ),
        })?;

        metrics::SNAPSHOTS_BUILT.inc();
        info!(
            chunks = chunks.len(),
            bytes = bytes.len(),
            "Built backend snapshot"
        );
        Ok(bytes)
    }

    /// Replace the backend's state from a framed chunk stream.
    ///
    /// A codec failure aborts before any chunk reaches the backend, leaving
    /// its pre-restore state intact; the leader will retry the snapshot.
    pub async fn restore_framed(&self, bytes: &[u8]) -> Result<(), StorageError<NodeId>> {
        let chunks = snapshot::read_frames(bytes).map_err(|e| StorageError::IO {
            source: StorageIOError::new(
                ErrorSubject::Snapshot(None),
                ErrorVerb::Read,
                AnyError::error(format!("snapshot stream corrupt: {e}")),
            ),
        })?;

        if chunks.is_empty() {
            info!("Empty snapshot stream; nothing to restore");
            return Ok(());
        }

        let count = chunks.len();
        self.backend
            .import_snapshot(chunks)
            .await
            .map_err(|e| StorageError::IO {
                source: StorageIOError::new(
                    ErrorSubject::Snapshot(None),
                    ErrorVerb::Write,
                    AnyError::error(format!("backend snapshot import failed: {e}")),
                ),
            })?;

        // Collections from before this node's log prefix are not re-learned
        // from the opaque file stream; their dimension checks defer to the
        // backend until re-created.
        self.collections.lock().unwrap().clear();

        metrics::SNAPSHOT_INSTALLS.inc();
        info!(chunks = count, "Restored backend state from snapshot");
        Ok(())
    }

    fn remember_collection(
        &self,
        name: &str,
        vector_dimension: u32,
        distance_function: DistanceFunction,
    ) {
        self.collections.lock().unwrap().insert(
            name.to_string(),
            CollectionMeta {
                vector_dimension,
                distance_function,
            },
        );
    }

    /// Shared policy for backend errors that are not command-specific
    /// idempotent cases: transient infrastructure failures halt the node,
    /// deterministic rejections become reports.
    fn classify_backend_error(
        &self,
        command: &Command,
        err: BackendError,
    ) -> Result<CommandResponse, StorageError<NodeId>> {
        if err.is_transient() {
            error!(
                command = command.kind(),
                collection = command.collection_name(),
                error = %err,
                "Backend unreachable during apply; halting to avoid divergence"
            );
            return Err(StorageError::IO {
                source: StorageIOError::new(
                    ErrorSubject::StateMachine,
                    ErrorVerb::Write,
                    AnyError::error(err.to_string()),
                ),
            });
        }
        warn!(
            command = command.kind(),
            collection = command.collection_name(),
            error = %err,
            "Backend rejected committed command"
        );
        Ok(CommandResponse::rejected(err.to_string()))
    }
}

fn divergence_error(command: &Command, msg: &str) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::new(
            ErrorSubject::StateMachine,
            ErrorVerb::Write,
            AnyError::error(format!(
                "replica divergence applying {}: {}",
                command.kind(),
                msg
            )),
        ),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
