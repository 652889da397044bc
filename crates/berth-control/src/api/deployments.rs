//! Deployment management endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use tracing::info;

use crate::error::ControlError;
use crate::types::{DeployRequest, DeploymentRecord};

use super::AppState;

/// Deployment status payload returned by deploy and list.
#[derive(Debug, Serialize)]
pub struct DeploymentStatus {
    /// Lifecycle status string.
    pub status: String,
    /// Model identifier.
    pub model_id: String,
    /// The launch command line.
    pub deployment_command: String,
    /// Path of the deployment log file.
    pub log_file: String,
    /// Port the worker listens on.
    pub port: u16,
    /// GPU index used in single-GPU mode.
    pub gpu_id: u32,
    /// Isolated environment path, when one was provisioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_path: Option<String>,
    /// Whether the worker spans all GPUs.
    pub use_all_gpus: bool,
    /// Architecture override, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture_override: Option<String>,
    /// Tensor parallelism degree, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tensor_parallel_size: Option<u32>,
}

impl DeploymentStatus {
    fn from_record(status: String, record: &DeploymentRecord) -> Self {
        Self {
            status,
            model_id: record.model_id.clone(),
            deployment_command: record.command_line.clone(),
            log_file: record.log_path.display().to_string(),
            port: record.port,
            gpu_id: record.gpu_id,
            env_path: record.env_path.as_ref().map(|p| p.display().to_string()),
            use_all_gpus: record.use_all_gpus,
            architecture_override: record.architecture_override.clone(),
            tensor_parallel_size: record.tensor_parallel_size,
        }
    }
}

/// Response for a successful stop.
#[derive(Debug, Serialize)]
pub struct StoppedResponse {
    /// Always `stopped`.
    pub status: &'static str,
    /// Model identifier that was stopped.
    pub model_id: String,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn into_api_error(error: ControlError) -> ApiError {
    let status = error_to_status(&error);
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

const fn error_to_status(error: &ControlError) -> StatusCode {
    match error {
        ControlError::ModelNotFound(_) | ControlError::DeploymentNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        ControlError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Deploy a model worker.
pub async fn deploy_model(
    State(state): State<AppState>,
    Json(request): Json<DeployRequest>,
) -> Result<Json<DeploymentStatus>, ApiError> {
    info!(model_id = %request.model_id, "deploy requested via API");

    let outcome = state.manager.deploy(request).await.map_err(into_api_error)?;

    let status = if outcome.already_deployed {
        "already_deployed"
    } else {
        "deploying"
    };
    Ok(Json(DeploymentStatus::from_record(
        status.to_owned(),
        &outcome.record,
    )))
}

/// List all deployments with live-reconciled status strings.
pub async fn list_deployments(State(state): State<AppState>) -> Json<Vec<DeploymentStatus>> {
    let records = state.manager.list().await;
    Json(
        records
            .iter()
            .map(|record| DeploymentStatus::from_record(record.display_status(), record))
            .collect(),
    )
}

/// Stop a deployment and remove its record.
pub async fn stop_deployment(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<StoppedResponse>, ApiError> {
    info!(model_id = %model_id, "stop requested via API");

    state.manager.stop(&model_id).await.map_err(into_api_error)?;

    Ok(Json(StoppedResponse {
        status: "stopped",
        model_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::tests::make_app_state;
    use super::super::router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn deploy_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/deploy")
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn deploy_then_duplicate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = make_app_state(dir.path(), 18511, 18520);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(deploy_request(r#"{"model_id": "org/model-a"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "deploying");
        assert_eq!(body["model_id"], "org/model-a");
        let port = body["port"].as_u64().unwrap();
        assert!((18511..=18520).contains(&(port as u16)));

        let response = app
            .oneshot(deploy_request(r#"{"model_id": "org/model-a"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "already_deployed");
        assert_eq!(body["port"].as_u64().unwrap(), port);
    }

    #[tokio::test]
    async fn deploy_unknown_model_is_404() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = make_app_state(dir.path(), 18521, 18530);
        let app = router(state);

        let response = app
            .oneshot(deploy_request(r#"{"model_id": "org/unknown"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deploy_invalid_utilisation_is_400() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = make_app_state(dir.path(), 18531, 18540);
        let app = router(state);

        let response = app
            .oneshot(deploy_request(
                r#"{"model_id": "org/model-a", "gpu_memory_utilization": 1.5}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_reflects_deployments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = make_app_state(dir.path(), 18541, 18550);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/deployments")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body.as_array().unwrap().len(), 0);

        app.clone()
            .oneshot(deploy_request(r#"{"model_id": "org/model-a"}"#))
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/deployments")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(response).await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["model_id"], "org/model-a");
    }

    #[tokio::test]
    async fn stop_unknown_model_is_404() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = make_app_state(dir.path(), 18551, 18560);
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/deployments/org/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_removes_a_deployment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = make_app_state(dir.path(), 18561, 18570);
        let app = router(state.clone());

        app.clone()
            .oneshot(deploy_request(r#"{"model_id": "org/model-a"}"#))
            .await
            .unwrap();

        // Model ids contain a slash; the wildcard route must capture it.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/deployments/org/model-a")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["model_id"], "org/model-a");

        assert!(state.manager.get("org/model-a").await.is_none());
    }
}
