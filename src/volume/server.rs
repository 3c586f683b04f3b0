//! Storage node server

use crate::bootstrap::Bootstrap;
use crate::common::{Result, VolumeConfig, Whitelist};
use crate::volume::agent::NodeAgent;
use crate::volume::http::{create_router, VolumeState};
use crate::volume::store::Store;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub struct VolumeServer {
    config: Arc<VolumeConfig>,
    bootstrap: Bootstrap,
}

impl VolumeServer {
    /// `bootstrap` gates heartbeating; pass [`Bootstrap::completed`] when no
    /// master shares the process
    pub fn new(config: VolumeConfig, bootstrap: Bootstrap) -> Self {
        Self {
            config: Arc::new(config),
            bootstrap,
        }
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
        self.config.validate()?;
        tracing::info!("Starting volume server: {}", self.config.address);
        tracing::info!("  HTTP API: {}", listener.local_addr()?);
        tracing::info!("  Public URL: {}", self.config.public_url());
        tracing::info!(
            "  Location: {}/{}",
            self.config.data_center,
            self.config.rack
        );
        for (folder, max) in self.config.folders.iter().zip(&self.config.max_volume_counts) {
            tracing::info!("  Folder: {} (max {} volumes)", folder.display(), max);
        }
        tracing::info!("  Masters: {:?}", self.config.masters);

        let store = Arc::new(Store::open(
            &self.config.folders,
            &self.config.max_volume_counts,
        )?);
        tracing::info!("Loaded {} existing volumes", store.volume_count());

        let agent = Arc::new(NodeAgent::new(self.config.clone(), store)?);
        let state = VolumeState {
            agent: agent.clone(),
            whitelist: Arc::new(Whitelist::parse(&self.config.whitelist)?),
        };
        let router = create_router(state, Duration::from_secs(self.config.idle_timeout_secs));

        let agent_task = tokio::spawn(agent.run(self.bootstrap.clone(), shutdown.clone()));

        tracing::info!("✓ Volume server ready");

        let mut server_shutdown = shutdown;
        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        });
        if let Err(e) = server.await {
            tracing::error!("HTTP server error: {}", e);
        }

        // Let the departure heartbeat go out before exiting
        if let Err(e) = agent_task.await {
            tracing::error!("Node agent task failed: {}", e);
        }
        tracing::info!("Volume server stopped");
        Ok(())
    }
}
