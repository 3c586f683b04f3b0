//! Master server

use crate::bootstrap::{Bootstrap, StartupPhase};
use crate::common::{format_bytes, MasterConfig, Result, Whitelist};
use crate::coordinator::heartbeat::{spawn_leadership_watcher, spawn_staleness_sweeper};
use crate::coordinator::http::{create_router, MasterState};
use crate::coordinator::raft_log::RocksLogStore;
use crate::coordinator::raft_node::RaftNode;
use crate::coordinator::raft_rpc_client::HttpTransport;
use crate::coordinator::topology::{TopologySettings, TopologyStore};
use crate::coordinator::volume_client::VolumeClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub struct MasterServer {
    config: MasterConfig,
    bootstrap: Bootstrap,
}

impl MasterServer {
    pub fn new(config: MasterConfig, bootstrap: Bootstrap) -> Self {
        Self { config, bootstrap }
    }

    pub async fn serve(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_with_listener(listener, shutdown).await
    }

    pub async fn serve_with_listener(
        self,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let config = self.config;
        config.validate()?;
        let peers = config.peer_set();

        tracing::info!("Starting master: {}", config.address);
        tracing::info!("  HTTP API: {}", listener.local_addr()?);
        tracing::info!("  Meta dir: {}", config.meta_dir.display());
        tracing::info!("  Peers: {:?}", peers);
        tracing::info!(
            "  Default replication: {}",
            config.default_replica_placement
        );
        tracing::info!(
            "  Volume size limit: {}",
            format_bytes(config.volume_size_limit_bytes())
        );

        let log_store = Arc::new(RocksLogStore::open(config.meta_dir.join("raft"))?);
        let topology = Arc::new(TopologyStore::new(TopologySettings {
            default_replica_placement: config.default_replica_placement,
            volume_size_limit: config.volume_size_limit_bytes(),
            garbage_threshold: config.garbage_threshold,
        }));
        let raft_config = config.raft();
        let transport = Arc::new(HttpTransport::new(raft_config.election_timeout)?);
        let raft = RaftNode::new(
            config.address.clone(),
            peers,
            raft_config,
            log_store,
            transport,
            topology.clone(),
        )?;

        let state = MasterState::new(
            topology.clone(),
            raft.clone(),
            Whitelist::parse(&config.whitelist)?,
            VolumeClient::new(config.pulse())?,
        );
        let router = create_router(state, Duration::from_secs(config.idle_timeout_secs));

        let mut server_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
        });
        self.bootstrap.advance(StartupPhase::EndpointReady)?;

        let raft_task = raft.start();
        raft.mark_ready();
        self.bootstrap.advance(StartupPhase::ConsensusInitialized)?;

        let sweeper = spawn_staleness_sweeper(
            topology.clone(),
            raft.clone(),
            config.pulse(),
            config.stale_after(),
            shutdown.clone(),
        );
        let watcher = spawn_leadership_watcher(topology, raft.clone(), shutdown);
        self.bootstrap.advance(StartupPhase::NodeAgentAllowed)?;

        tracing::info!("✓ Master ready ({})", raft.role());

        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
            Err(e) => tracing::error!("HTTP server task failed: {}", e),
        }

        raft.shutdown();
        let _ = raft_task.await;
        let _ = sweeper.await;
        let _ = watcher.await;
        tracing::info!("Master stopped");
        Ok(())
    }
}
