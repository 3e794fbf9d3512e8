//! Node binary: wires configuration, storage, consensus and the gRPC
//! listeners together, then waits for ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vectormesh::backend::BackendHandle;
use vectormesh::client::ClusterClient;
use vectormesh::cluster::{self, ClusterHandle};
use vectormesh::config::{consensus_port, coordination_port, NodeConfig};
use vectormesh::fsm::ReplicatedStateMachine;
use vectormesh::metrics;
use vectormesh::raft::{start_consensus_node, ConsensusNode};
use vectormesh::service::{self, CoordinationService};
use vectormesh::store::ClusterStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    metrics::register_all();

    let config = NodeConfig::from_env();
    info!(
        node_id = %config.node_id,
        consensus_addr = %config.consensus_addr(),
        coordination_addr = %config.coordination_addr(),
        backend_addr = %config.backend_addr,
        bootstrap = config.bootstrap,
        "Starting vectormesh node"
    );

    let backend = BackendHandle::connect_lazy(&config.backend_addr)?;
    let fsm = ReplicatedStateMachine::new(backend, config.snapshot_chunk_size);
    let store = ClusterStore::open(&config.data_dir, fsm.clone())?;

    let handle = ClusterHandle::new(config.clone());
    let consensus = start_consensus_node(&config, store, handle.clone()).await?;

    tokio::spawn(service::start_consensus_server(
        consensus.clone(),
        format!("0.0.0.0:{}", consensus_port(config.base_port)),
    ));
    tokio::spawn(service::start_coordination_server(
        CoordinationService::new(consensus.clone(), fsm, config.apply_timeout),
        format!("0.0.0.0:{}", coordination_port(config.base_port)),
    ));
    tokio::spawn(cluster::start_health_server(handle));

    if config.bootstrap {
        consensus.bootstrap().await?;
    } else if !config.seed_addrs.is_empty() {
        tokio::spawn(join_via_seeds(config.clone(), consensus.clone()));
    } else {
        info!("No bootstrap flag and no seeds; waiting to be added by an existing leader");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    consensus.shutdown().await;
    Ok(())
}

/// Keep asking the cluster to admit this node until it is a voter.
///
/// Every attempt goes through the redirect-following client, so any live
/// seed is enough even while leadership moves around.
async fn join_via_seeds(config: NodeConfig, consensus: Arc<ConsensusNode>) {
    let client = ClusterClient::new(config.seed_addrs.clone(), config.max_redirects);
    let consensus_addr = config.consensus_addr();

    let mut backoff = Duration::from_millis(500);
    const MAX_BACKOFF: Duration = Duration::from_secs(15);

    loop {
        let already_voter = consensus
            .configuration()
            .iter()
            .any(|m| m.id == consensus.node_id && m.is_voter);
        if already_voter {
            info!(node_id = %config.node_id, "Cluster membership confirmed");
            return;
        }

        match client.join_cluster(&config.node_id, &consensus_addr).await {
            Ok(reply) if reply.success => {
                info!(
                    node_id = %config.node_id,
                    leader_id = %reply.leader_id,
                    "Joined cluster"
                );
                return;
            }
            Ok(reply) => {
                warn!(message = %reply.message, "Join request rejected; retrying");
            }
            Err(e) => {
                warn!(error = %e, backoff_ms = backoff.as_millis(), "Join attempt failed; retrying");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
