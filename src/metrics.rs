//! Prometheus metrics for the replication pipeline.
//!
//! Exposed in text format on the health listener's `GET /metrics` endpoint.

use prometheus::{IntCounter, IntCounterVec, Opts};

lazy_static::lazy_static! {
    /// Committed commands applied to the local backend, by command type.
    pub static ref COMMANDS_APPLIED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "vectormesh_commands_applied_total",
            "Committed commands applied to the local backend",
        ),
        &["type"],
    )
    .unwrap();

    /// Leader redirects issued to clients by the redirect filter.
    pub static ref REDIRECTS_ISSUED: IntCounter = IntCounter::new(
        "vectormesh_redirects_issued_total",
        "Write/membership RPCs answered with a leader redirect",
    )
    .unwrap();

    /// Snapshots built from the local backend.
    pub static ref SNAPSHOTS_BUILT: IntCounter = IntCounter::new(
        "vectormesh_snapshots_built_total",
        "Snapshots exported from the local backend",
    )
    .unwrap();

    /// Snapshots installed into the local backend.
    pub static ref SNAPSHOT_INSTALLS: IntCounter = IntCounter::new(
        "vectormesh_snapshot_installs_total",
        "Snapshots restored into the local backend",
    )
    .unwrap();
}

/// Register all collectors with the default registry. Re-registration (e.g.
/// in tests) is a no-op.
pub fn register_all() {
    let registry = prometheus::default_registry();
    let _ = registry.register(Box::new(COMMANDS_APPLIED.clone()));
    let _ = registry.register(Box::new(REDIRECTS_ISSUED.clone()));
    let _ = registry.register(Box::new(SNAPSHOTS_BUILT.clone()));
    let _ = registry.register(Box::new(SNAPSHOT_INSTALLS.clone()));
}
