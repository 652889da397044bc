//! Core types for berth-control.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ControlError, ControlResult};
use crate::state::DeployState;
use crate::supervisor::{WorkerHandle, WorkerStatus};

/// Request to deploy a model worker.
///
/// Doubles as the `POST /deploy` body; defaults match the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Model identifier, e.g. `Qwen/Qwen2-7B-Instruct`.
    pub model_id: String,
    /// GPU index used when `use_all_gpus` is false.
    #[serde(default)]
    pub gpu_id: u32,
    /// Maximum context length; clamped to the model's limit.
    #[serde(default)]
    pub max_model_len: Option<u32>,
    /// Vision batch size (multimodal models only).
    #[serde(default)]
    pub vision_batch_size: Option<u32>,
    /// Fraction of GPU memory the worker may use.
    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f64,
    /// Specific port to listen on; auto-assigned when absent or taken.
    #[serde(default)]
    pub port: Option<u16>,
    /// Provision an isolated runtime environment for the worker.
    #[serde(default = "default_true")]
    pub isolate_env: bool,
    /// Spread the worker across all available GPUs.
    #[serde(default = "default_true")]
    pub use_all_gpus: bool,
    /// Override the model architecture reported to the backend.
    #[serde(default)]
    pub architecture_override: Option<String>,
    /// Explicit tensor parallelism degree.
    #[serde(default)]
    pub tensor_parallel_size: Option<u32>,
}

const fn default_gpu_memory_utilization() -> f64 {
    0.9
}

const fn default_true() -> bool {
    true
}

impl DeployRequest {
    /// Validate request fields that serde cannot check.
    pub fn validate(&self) -> ControlResult<()> {
        if self.model_id.trim().is_empty() {
            return Err(ControlError::validation("model_id must not be empty"));
        }
        if !(self.gpu_memory_utilization > 0.0 && self.gpu_memory_utilization <= 1.0) {
            return Err(ControlError::validation(
                "gpu_memory_utilization must be in (0, 1]",
            ));
        }
        if self.tensor_parallel_size == Some(0) {
            return Err(ControlError::validation(
                "tensor_parallel_size must be at least 1",
            ));
        }
        if self.vision_batch_size == Some(0) {
            return Err(ControlError::validation(
                "vision_batch_size must be at least 1",
            ));
        }
        if self.port == Some(0) {
            return Err(ControlError::validation("port must be nonzero"));
        }
        Ok(())
    }
}

/// The registry's unit of state for one model's worker lifecycle.
#[derive(Debug, Clone)]
pub struct DeploymentRecord {
    /// Model identifier, the registry key.
    pub model_id: String,
    /// Stored lifecycle state.
    pub state: DeployState,
    /// Port assigned at creation; immutable for the record's lifetime.
    pub port: u16,
    /// GPU index used when `use_all_gpus` is false.
    pub gpu_id: u32,
    /// Whether the worker spreads across all GPUs.
    pub use_all_gpus: bool,
    /// Requested tensor parallelism degree.
    pub tensor_parallel_size: Option<u32>,
    /// Requested architecture override.
    pub architecture_override: Option<String>,
    /// Isolated environment root; `None` means the system runtime.
    pub env_path: Option<PathBuf>,
    /// Display rendering of the launch command.
    pub command_line: String,
    /// Per-deployment append-only log file.
    pub log_path: PathBuf,
    /// Handle to the live worker; `None` until launch.
    pub worker: Option<WorkerHandle>,
    /// Exit code once the worker has exited.
    pub exit_code: Option<i32>,
    /// Cancellation token driving the stop path for this deployment.
    pub cancel: CancellationToken,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// Create a fresh record in the `deploying` state.
    #[must_use]
    pub fn new(request: &DeployRequest, port: u16, command_line: String, log_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            model_id: request.model_id.clone(),
            state: DeployState::Deploying,
            port,
            gpu_id: request.gpu_id,
            use_all_gpus: request.use_all_gpus,
            tensor_parallel_size: request.tensor_parallel_size,
            architecture_override: request.architecture_override.clone(),
            env_path: None,
            command_line,
            log_path,
            worker: None,
            exit_code: None,
            cancel: CancellationToken::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Live-reconciled status string.
    ///
    /// The stored state stays `deploying` for as long as the worker
    /// process is alive; a reader sees `running` instead. A worker that
    /// exited before the supervisor recorded a verdict shows up as
    /// `exited (code: N)`.
    #[must_use]
    pub fn display_status(&self) -> String {
        match &self.worker {
            Some(worker) => match worker.status() {
                WorkerStatus::Running => "running".to_owned(),
                WorkerStatus::Exited(code) => {
                    if self.state == DeployState::Deploying {
                        format!("exited (code: {code})")
                    } else {
                        self.state.as_str().to_owned()
                    }
                }
            },
            None => self.state.as_str().to_owned(),
        }
    }
}
