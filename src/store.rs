//! Persistent Raft storage: log, stable state and snapshot retention.
//!
//! Implements openraft's combined v1 `RaftStorage` interface, bridged into
//! the v2 `RaftLogStorage` + `RaftStateMachine` split by
//! `openraft::storage::Adaptor` at node startup. State-machine applies are
//! delegated to [`ReplicatedStateMachine`], which talks to the backend.
//!
//! ## File layout
//!
//! ```text
//! {data_dir}/
//! ├── raft-log.db      # Append-only log entry records
//! ├── raft-stable.db   # Vote, committed/purged ids, applied state (JSON)
//! └── snapshots/       # Newest framed chunk stream + its metadata
//!     ├── {id}.snap
//!     └── {id}.meta.json
//! ```
//!
//! ## Log record format
//!
//! Each record is a fixed 28-byte header followed by a JSON-encoded entry:
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ magic: u32 (0x564D5348 "VMSH")     │
//! │ checksum: u32 (CRC32 of payload)   │
//! │ length: u32                        │
//! │ index: u64                         │
//! │ term: u64                          │
//! ├────────────────────────────────────┤
//! │ payload (serde_json Entry)         │
//! └────────────────────────────────────┘
//! ```
//!
//! A record that fails its magic, checksum or decode check makes `open`
//! fail: an undecodable committed entry means protocol corruption, and the
//! node halts rather than silently diverge.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use openraft::storage::{LogState, RaftLogReader, RaftSnapshotBuilder, RaftStorage, Snapshot};
use openraft::{
    AnyError, BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, RaftLogId,
    SnapshotMeta, StorageError, StorageIOError, StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::CommandResponse;
use crate::fsm::ReplicatedStateMachine;
use crate::raft::{NodeId, TypeConfig};

const LOG_FILE: &str = "raft-log.db";
const STABLE_FILE: &str = "raft-stable.db";
const SNAPSHOT_DIR: &str = "snapshots";

/// Magic bytes for log record validation: "VMSH" in ASCII.
const LOG_MAGIC: u32 = 0x564D_5348;

/// Size of the log record header in bytes.
const HEADER_SIZE: usize = 28;

/// Persistent state stored in `raft-stable.db`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StableState {
    /// Current vote (term and candidate voted for).
    vote: Option<Vote<NodeId>>,
    /// Committed log id, saved so commit progress survives restarts.
    committed: Option<LogId<NodeId>>,
    /// Entries at or below this id have been compacted away.
    last_purged: Option<LogId<NodeId>>,
    /// Counter giving snapshots unique ids.
    snapshot_idx: u64,
    /// State machine progress.
    last_applied: Option<LogId<NodeId>>,
    /// Latest applied membership configuration.
    last_membership: StoredMembership<NodeId, BasicNode>,
}

struct StoreInner {
    data_dir: PathBuf,
    log: Mutex<BTreeMap<u64, Entry<TypeConfig>>>,
    stable: Mutex<StableState>,
    current_snapshot: Mutex<Option<Snapshot<TypeConfig>>>,
    fsm: ReplicatedStateMachine,
}

/// Clonable handle to this node's Raft storage.
///
/// `Adaptor::new` hands one clone to the log half and one to the state
/// machine half; both share the same files and in-memory views.
#[derive(Clone)]
pub struct ClusterStore {
    inner: Arc<StoreInner>,
}

impl ClusterStore {
    /// Open (or create) the store under `data_dir`, replaying the persisted
    /// log and stable state.
    pub fn open(
        data_dir: impl Into<PathBuf>,
        fsm: ReplicatedStateMachine,
    ) -> Result<Self, StorageError<NodeId>> {
        let data_dir = data_dir.into();
        fs::create_dir_all(data_dir.join(SNAPSHOT_DIR))
            .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Write, e))?;

        let stable = load_stable(&data_dir)?;
        let log = load_log(&data_dir.join(LOG_FILE))?;
        let current_snapshot = load_current_snapshot(&data_dir)?;

        info!(
            data_dir = %data_dir.display(),
            log_entries = log.len(),
            last_applied = ?stable.last_applied,
            has_snapshot = current_snapshot.is_some(),
            "Opened Raft store"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                data_dir,
                log: Mutex::new(log),
                stable: Mutex::new(stable),
                current_snapshot: Mutex::new(current_snapshot),
                fsm,
            }),
        })
    }

    pub fn fsm(&self) -> &ReplicatedStateMachine {
        &self.inner.fsm
    }

    fn log_path(&self) -> PathBuf {
        self.inner.data_dir.join(LOG_FILE)
    }
}

// ── Log reader ────────────────────────────────────────────────────────────────

impl RaftLogReader<TypeConfig> for ClusterStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self
            .inner
            .log
            .lock()
            .unwrap()
            .range(range)
            .map(|(_, e)| e.clone())
            .collect())
    }
}

// ── Snapshot builder ──────────────────────────────────────────────────────────

/// Exports the backend through the state machine and persists the framed
/// stream under `snapshots/`.
pub struct StoreSnapshotBuilder {
    store: ClusterStore,
}

impl RaftSnapshotBuilder<TypeConfig> for StoreSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let bytes = self.store.inner.fsm.export_framed().await?;

        let (last_applied, last_membership, snapshot_id) = {
            let mut stable = self.store.inner.stable.lock().unwrap();
            stable.snapshot_idx += 1;
            let snapshot_id = match stable.last_applied {
                Some(last) => format!("{}-{}-{}", last.leader_id, last.index, stable.snapshot_idx),
                None => format!("genesis-{}", stable.snapshot_idx),
            };
            persist_stable(&self.store.inner.data_dir, &stable)?;
            (stable.last_applied, stable.last_membership.clone(), snapshot_id)
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id,
        };
        persist_snapshot(&self.store.inner.data_dir, &meta, &bytes)?;

        let snapshot = Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(bytes)),
        };
        *self.store.inner.current_snapshot.lock().unwrap() = Some(snapshot.clone());
        Ok(snapshot)
    }
}

// ── Combined v1 storage ───────────────────────────────────────────────────────

impl RaftStorage<TypeConfig> for ClusterStore {
    type LogReader = Self;
    type SnapshotBuilder = StoreSnapshotBuilder;

    // ── Vote ──────────────────────────────────────────────────────────────

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let mut stable = self.inner.stable.lock().unwrap();
        stable.vote = Some(*vote);
        persist_stable(&self.inner.data_dir, &stable)
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.inner.stable.lock().unwrap().vote)
    }

    // ── Log ───────────────────────────────────────────────────────────────

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = {
            let log = self.inner.log.lock().unwrap();
            log.values().next_back().map(|e| *e.get_log_id())
        };
        let last_purged = self.inner.stable.lock().unwrap().last_purged;
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id: last.or(last_purged),
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        let mut stable = self.inner.stable.lock().unwrap();
        stable.committed = committed;
        persist_stable(&self.inner.data_dir, &stable)
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.inner.stable.lock().unwrap().committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let path = self.log_path();
        let mut log = self.inner.log.lock().unwrap();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Write, e))?;
        for entry in entries {
            append_log_record(&mut file, &entry)?;
            log.insert(entry.get_log_id().index, entry);
        }
        file.sync_data()
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Write, e))?;
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        debug!(index = log_id.index, "Truncating conflicting log suffix");
        let mut log = self.inner.log.lock().unwrap();
        log.retain(|&idx, _| idx < log_id.index);
        rewrite_log(&self.log_path(), &log)
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        debug!(index = log_id.index, "Purging applied log prefix");
        {
            let mut stable = self.inner.stable.lock().unwrap();
            stable.last_purged = Some(log_id);
            persist_stable(&self.inner.data_dir, &stable)?;
        }
        let mut log = self.inner.log.lock().unwrap();
        log.retain(|&idx, _| idx > log_id.index);
        rewrite_log(&self.log_path(), &log)
    }

    // ── State machine ─────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let stable = self.inner.stable.lock().unwrap();
        Ok((stable.last_applied, stable.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<CommandResponse>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            let response = match &entry.payload {
                EntryPayload::Blank => CommandResponse::ok("noop"),
                // The backend call happens without any store lock held.
                EntryPayload::Normal(command) => self.inner.fsm.apply(command).await?,
                EntryPayload::Membership(membership) => {
                    let mut stable = self.inner.stable.lock().unwrap();
                    stable.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), membership.clone());
                    CommandResponse::ok("membership change applied")
                }
            };

            let mut stable = self.inner.stable.lock().unwrap();
            stable.last_applied = Some(*entry.get_log_id());
            persist_stable(&self.inner.data_dir, &stable)?;
            drop(stable);

            responses.push(response);
        }

        Ok(responses)
    }

    // ── Snapshots ─────────────────────────────────────────────────────────

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        StoreSnapshotBuilder {
            store: self.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let bytes = snapshot.into_inner();
        info!(
            snapshot_id = %meta.snapshot_id,
            bytes = bytes.len(),
            "Installing snapshot from leader"
        );

        // Restore fails atomically before anything reaches the backend if
        // the stream is corrupt; the pre-restore replica state survives.
        self.inner.fsm.restore_framed(&bytes).await?;

        {
            let mut stable = self.inner.stable.lock().unwrap();
            stable.last_applied = meta.last_log_id;
            stable.last_membership = meta.last_membership.clone();
            persist_stable(&self.inner.data_dir, &stable)?;
        }
        persist_snapshot(&self.inner.data_dir, meta, &bytes)?;

        *self.inner.current_snapshot.lock().unwrap() = Some(Snapshot {
            meta: meta.clone(),
            snapshot: Box::new(Cursor::new(bytes)),
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.inner.current_snapshot.lock().unwrap().clone())
    }
}

// ── Persistence helpers ───────────────────────────────────────────────────────

fn io_err(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: impl std::fmt::Display,
) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::new(subject, verb, AnyError::error(err.to_string())),
    }
}

fn append_log_record(file: &mut File, entry: &Entry<TypeConfig>) -> Result<(), StorageError<NodeId>> {
    let payload = serde_json::to_vec(entry)
        .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Write, e))?;
    let log_id = entry.get_log_id();

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&LOG_MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    header[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    header[12..20].copy_from_slice(&log_id.index.to_le_bytes());
    header[20..28].copy_from_slice(&log_id.leader_id.term.to_le_bytes());

    file.write_all(&header)
        .and_then(|_| file.write_all(&payload))
        .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Write, e))
}

fn load_log(path: &Path) -> Result<BTreeMap<u64, Entry<TypeConfig>>, StorageError<NodeId>> {
    let mut map = BTreeMap::new();
    if !path.exists() {
        return Ok(map);
    }

    let mut buf = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut buf))
        .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Read, e))?;

    let mut pos = 0usize;
    while pos < buf.len() {
        if buf.len() - pos < HEADER_SIZE {
            return Err(io_err(
                ErrorSubject::Logs,
                ErrorVerb::Read,
                "truncated log record header",
            ));
        }
        let magic = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        if magic != LOG_MAGIC {
            return Err(io_err(
                ErrorSubject::Logs,
                ErrorVerb::Read,
                format!("bad log record magic {magic:#x}"),
            ));
        }
        let checksum = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap());
        let length = u32::from_le_bytes(buf[pos + 8..pos + 12].try_into().unwrap()) as usize;
        pos += HEADER_SIZE;

        if buf.len() - pos < length {
            return Err(io_err(
                ErrorSubject::Logs,
                ErrorVerb::Read,
                "truncated log record payload",
            ));
        }
        let payload = &buf[pos..pos + length];
        if crc32fast::hash(payload) != checksum {
            return Err(io_err(
                ErrorSubject::Logs,
                ErrorVerb::Read,
                "log record checksum mismatch",
            ));
        }

        let entry: Entry<TypeConfig> = serde_json::from_slice(payload)
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Read, e))?;
        map.insert(entry.get_log_id().index, entry);
        pos += length;
    }
    Ok(map)
}

/// Rewrite the whole log file. Used after truncation and purge, which are
/// rare compared to appends.
fn rewrite_log(
    path: &Path,
    log: &BTreeMap<u64, Entry<TypeConfig>>,
) -> Result<(), StorageError<NodeId>> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Write, e))?;
        for entry in log.values() {
            append_log_record(&mut file, entry)?;
        }
        file.sync_data()
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Write, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Write, e))
}

fn load_stable(data_dir: &Path) -> Result<StableState, StorageError<NodeId>> {
    let path = data_dir.join(STABLE_FILE);
    if !path.exists() {
        return Ok(StableState::default());
    }
    let mut buf = String::new();
    File::open(&path)
        .and_then(|mut f| f.read_to_string(&mut buf))
        .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Read, e))?;
    serde_json::from_str(&buf).map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Read, e))
}

fn persist_stable(data_dir: &Path, state: &StableState) -> Result<(), StorageError<NodeId>> {
    let path = data_dir.join(STABLE_FILE);
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Write, e))?;
    fs::write(&tmp, json).map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Write, e))?;
    fs::rename(&tmp, &path).map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Write, e))
}

/// Persist the framed stream plus its metadata, dropping older snapshots.
fn persist_snapshot(
    data_dir: &Path,
    meta: &SnapshotMeta<NodeId, BasicNode>,
    bytes: &[u8],
) -> Result<(), StorageError<NodeId>> {
    let dir = data_dir.join(SNAPSHOT_DIR);
    let subject = || ErrorSubject::Snapshot(None);

    // Only the newest snapshot is retained.
    if let Ok(existing) = fs::read_dir(&dir) {
        for dent in existing.flatten() {
            let _ = fs::remove_file(dent.path());
        }
    }

    fs::write(dir.join(format!("{}.snap", meta.snapshot_id)), bytes)
        .map_err(|e| io_err(subject(), ErrorVerb::Write, e))?;
    let meta_json = serde_json::to_vec_pretty(meta)
        .map_err(|e| io_err(subject(), ErrorVerb::Write, e))?;
    fs::write(dir.join(format!("{}.meta.json", meta.snapshot_id)), meta_json)
        .map_err(|e| io_err(subject(), ErrorVerb::Write, e))
}

fn load_current_snapshot(
    data_dir: &Path,
) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
    let dir = data_dir.join(SNAPSHOT_DIR);
    let subject = || ErrorSubject::Snapshot(None);

    let mut newest: Option<(SnapshotMeta<NodeId, BasicNode>, PathBuf)> = None;
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(None),
    };
    for dent in entries.flatten() {
        let path = dent.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        let Some(id) = name.strip_suffix(".meta.json") else {
            continue;
        };
        let mut buf = String::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_string(&mut buf))
            .map_err(|e| io_err(subject(), ErrorVerb::Read, e))?;
        let meta: SnapshotMeta<NodeId, BasicNode> = serde_json::from_str(&buf)
            .map_err(|e| io_err(subject(), ErrorVerb::Read, e))?;
        let snap_path = dir.join(format!("{id}.snap"));
        let replace = match &newest {
            Some((current, _)) => meta.last_log_id > current.last_log_id,
            None => true,
        };
        if replace {
            newest = Some((meta, snap_path));
        }
    }

    match newest {
        Some((meta, snap_path)) => {
            let bytes =
                fs::read(&snap_path).map_err(|e| io_err(subject(), ErrorVerb::Read, e))?;
            Ok(Some(Snapshot {
                meta,
                snapshot: Box::new(Cursor::new(bytes)),
            }))
        }
        None => Ok(None),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
