//! Coordinator server

use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::catalog::StaticCubeCatalog;
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::leadership::LocalElection;
use crate::coordinator::metadata::RocksTopologyStore;
use crate::coordinator::node_client::{HttpBuildSubmitter, HttpDirectiveSender};
use crate::coordinator::service::{Collaborators, CoordinatorService, ServiceOptions};
use std::sync::Arc;

pub struct Coordinator {
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        let config = self.config;
        tracing::info!("Starting coordinator: {}", config.node_id);
        tracing::info!("  HTTP API: {}", config.bind_addr);
        tracing::info!("  Advertised as: {}", config.advertised());
        tracing::info!("  DB path: {}", config.db_path.display());
        tracing::info!("  Build service: {}", config.build_service_url);
        tracing::info!("  Cubes in catalog: {}", config.cubes.len());

        // Durable topology store
        let persistence = Arc::new(RocksTopologyStore::open(&config.db_path)?);

        // Standalone deployments lead from the start
        let election = Arc::new(LocalElection::new(config.advertised(), config.standalone));

        let collaborators = Collaborators {
            persistence,
            election: election.clone(),
            catalog: Arc::new(StaticCubeCatalog::new(config.cubes.clone())),
            directives: Arc::new(HttpDirectiveSender::new(
                config.node_admin_prefix.clone(),
                config.directive_timeout(),
            )?),
            builds: Arc::new(HttpBuildSubmitter::new(
                config.build_service_url.clone(),
                config.build_submit_timeout(),
            )?),
        };
        let service =
            Arc::new(CoordinatorService::open(ServiceOptions::from(&config), collaborators).await?);
        let watcher = service.spawn_leadership_watcher();

        let router = create_router(
            CoordState {
                service: service.clone(),
                election,
            },
            config.max_body_bytes,
        );

        let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
        let role = if service.leadership().is_leader() {
            "leader"
        } else {
            "standby"
        };
        tracing::info!("✓ Coordinator ready ({})", role);

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;
        watcher.abort();

        if let Err(e) = result {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        tracing::info!("Coordinator stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
