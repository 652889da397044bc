//! HTTP API for the control service.
//!
//! Provides endpoints for:
//! - Deployment management (deploy, list, stop)
//! - Model catalog listing
//! - Health checks

mod deployments;
mod models;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::catalog::ModelCatalog;
use crate::deployment::DeploymentManager;

pub use deployments::{DeploymentStatus, ErrorResponse, StoppedResponse};

/// Shared application state for the control service.
#[derive(Clone)]
pub struct AppState {
    /// Deployment manager for orchestrating deployments.
    pub manager: Arc<DeploymentManager>,
    /// Model catalog for listings.
    pub catalog: Arc<ModelCatalog>,
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(health_check))
        // Deployment management
        .route("/deploy", post(deployments::deploy_model))
        .route("/deployments", get(deployments::list_deployments))
        // Model ids contain slashes, so the stop route captures the rest
        // of the path.
        .route(
            "/deployments/{*model_id}",
            delete(deployments::stop_deployment),
        )
        // Catalog passthrough
        .route("/models", get(models::list_models))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse { status: "healthy" })
}

/// Health response.
#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
}
