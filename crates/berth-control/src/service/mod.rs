//! Service lifecycle management.
//!
//! Provides the main service runner with signal handling and graceful shutdown.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api;
use crate::catalog::ModelCatalog;
use crate::config::ControlConfig;
use crate::deployment::DeploymentManager;
use crate::error::{ControlError, ControlResult};
use crate::ports::PortAllocator;
use crate::provisioner::{EnvironmentProvisioner, VenvProvisioner};
use crate::registry::DeploymentRegistry;

/// The control service.
///
/// Manages the lifecycle of the control plane, including:
/// - Model catalog loading
/// - Deployment registry and manager wiring
/// - HTTP API server
/// - Signal handling and graceful shutdown
pub struct ControlService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl ControlService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the control service.
    ///
    /// This will:
    /// 1. Load the model catalog
    /// 2. Create the deployment registry and manager
    /// 3. Start the HTTP API server
    /// 4. Wait for a shutdown signal
    ///
    /// Stopping the server does not stop running workers; the registry
    /// is memory-only and deployments do not survive a restart.
    pub async fn run(&self) -> ControlResult<()> {
        let catalog = Arc::new(ModelCatalog::from_file(&self.config.catalog.path)?);
        info!(
            path = %self.config.catalog.path.display(),
            models = catalog.all().len(),
            "model catalog loaded"
        );

        let registry = Arc::new(DeploymentRegistry::new(PortAllocator::new(
            &self.config.ports,
        )));

        let provisioner: Arc<dyn EnvironmentProvisioner> =
            Arc::new(VenvProvisioner::new(&self.config.environments));
        info!(
            base_dir = %self.config.environments.base_dir.display(),
            "environment provisioner configured"
        );

        let manager = Arc::new(DeploymentManager::new(
            registry,
            Arc::clone(&catalog),
            provisioner,
            self.config.deploy.clone(),
        ));
        info!("deployment manager initialised");

        let state = api::AppState { manager, catalog };
        let app = api::router(state);

        let listener = tokio::net::TcpListener::bind(self.config.server.listen_addr)
            .await
            .map_err(|e| ControlError::Config(format!("failed to bind TCP: {e}")))?;
        info!(addr = %self.config.server.listen_addr, "control service listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(self.cancel.clone()))
            .await
            .map_err(|e| ControlError::internal(format!("server error: {e}")))?;

        info!("control service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_creation() {
        let config = ControlConfig::default();
        let service = ControlService::new(config);
        assert!(!service.cancel.is_cancelled());
    }

    #[test]
    fn service_shutdown() {
        let config = ControlConfig::default();
        let service = ControlService::new(config);
        service.shutdown();
        assert!(service.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn run_fails_without_a_catalog() {
        let config = ControlConfig {
            catalog: crate::config::CatalogConfig {
                path: "/nonexistent/models_config.json".into(),
            },
            ..ControlConfig::default()
        };
        let service = ControlService::new(config);
        assert!(service.run().await.is_err());
    }
}
