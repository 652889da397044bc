//! Core deployment orchestration logic.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::catalog::{ModelCatalog, ModelSpec};
use crate::command::CommandBuilder;
use crate::config::DeployConfig;
use crate::error::{ControlError, ControlResult};
use crate::gpu;
use crate::logfile::DeploymentLog;
use crate::provisioner::{EnvOutcome, EnvironmentProvisioner};
use crate::registry::{DeploymentRegistry, Reservation};
use crate::state::DeployState;
use crate::supervisor::{ProcessSupervisor, WorkerStatus};
use crate::types::{DeployRequest, DeploymentRecord};

/// Extra wait beyond the graceful window when stopping, covering the
/// supervisor's kill escalation.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Result of a deploy call.
#[derive(Debug)]
pub struct DeployOutcome {
    /// Whether an existing record was returned instead of a new one.
    pub already_deployed: bool,
    /// The record as of this call.
    pub record: DeploymentRecord,
}

/// Orchestrates the deployment lifecycle.
///
/// The synchronous half of a deploy (validation, catalog lookup, port
/// reservation, record insertion) happens on the caller; everything
/// slow (environment provisioning, GPU detection, worker launch and
/// supervision) runs in one spawned pipeline task per deployment.
pub struct DeploymentManager {
    registry: Arc<DeploymentRegistry>,
    catalog: Arc<ModelCatalog>,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    builder: CommandBuilder,
    supervisor: Arc<ProcessSupervisor>,
    config: DeployConfig,
}

impl DeploymentManager {
    /// Create a new deployment manager.
    #[must_use]
    pub fn new(
        registry: Arc<DeploymentRegistry>,
        catalog: Arc<ModelCatalog>,
        provisioner: Arc<dyn EnvironmentProvisioner>,
        config: DeployConfig,
    ) -> Self {
        let builder = CommandBuilder::new(&config);
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&registry),
            Duration::from_secs(config.stop_timeout_secs),
        ));
        Self {
            registry,
            catalog,
            provisioner,
            builder,
            supervisor,
            config,
        }
    }

    /// Deploy a model worker.
    ///
    /// Returns as soon as the record exists; the pipeline continues in
    /// the background. A record that already exists for the model id is
    /// returned unchanged with `already_deployed` set.
    pub async fn deploy(&self, request: DeployRequest) -> ControlResult<DeployOutcome> {
        request.validate()?;

        let model = self
            .catalog
            .find(&request.model_id)
            .ok_or_else(|| ControlError::ModelNotFound(request.model_id.clone()))?
            .clone();

        let log_dir = self.config.log_dir.clone();
        let builder = &self.builder;
        let reservation = self
            .registry
            .reserve(&request.model_id, request.port, |port| {
                // Initial display command; the pipeline rebuilds it with
                // live GPU detection before launch.
                let built = builder.build(&request, &model, port, None);
                let log_path = log_dir.join(DeploymentLog::file_name(&request.model_id, port));
                DeploymentRecord::new(&request, port, built.plan.display(), log_path)
            })
            .await?;

        match reservation {
            Reservation::Existing(record) => {
                info!(model_id = %record.model_id, port = record.port, "already deployed");
                Ok(DeployOutcome {
                    already_deployed: true,
                    record,
                })
            }
            Reservation::Created(record) => {
                if let Some(requested) = request.port {
                    if requested != record.port {
                        info!(
                            model_id = %record.model_id,
                            requested,
                            assigned = record.port,
                            "requested port unavailable; reassigned"
                        );
                    }
                }
                self.spawn_pipeline(request, model, record.clone());
                Ok(DeployOutcome {
                    already_deployed: false,
                    record,
                })
            }
        }
    }

    /// All current records.
    pub async fn list(&self) -> Vec<DeploymentRecord> {
        self.registry.list().await
    }

    /// Fetch one record.
    pub async fn get(&self, model_id: &str) -> Option<DeploymentRecord> {
        self.registry.get(model_id).await
    }

    /// Stop a deployment and remove its record.
    ///
    /// A live worker gets a graceful terminate with kill escalation;
    /// the record is removed regardless of whether the worker had
    /// already exited.
    pub async fn stop(&self, model_id: &str) -> ControlResult<()> {
        let record = self
            .registry
            .get(model_id)
            .await
            .ok_or_else(|| ControlError::DeploymentNotFound(model_id.to_owned()))?;

        info!(model_id, port = record.port, "stopping deployment");
        record.cancel.cancel();

        if let Some(worker) = &record.worker {
            if worker.status() == WorkerStatus::Running {
                let window = Duration::from_secs(self.config.stop_timeout_secs) + STOP_GRACE;
                if worker.wait_exit(window).await.is_none() {
                    warn!(model_id, "worker still not reaped after kill escalation");
                }
            }
        }

        self.registry.remove(model_id).await?;
        info!(model_id, "deployment stopped");
        Ok(())
    }

    fn spawn_pipeline(&self, request: DeployRequest, model: ModelSpec, record: DeploymentRecord) {
        let registry = Arc::clone(&self.registry);
        let provisioner = Arc::clone(&self.provisioner);
        let supervisor = Arc::clone(&self.supervisor);
        let builder = self.builder.clone();

        tokio::spawn(async move {
            run_pipeline(
                registry,
                provisioner,
                supervisor,
                builder,
                request,
                model,
                record,
            )
            .await;
        });
    }
}

impl std::fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager").finish_non_exhaustive()
    }
}

/// The provision → build → launch pipeline for one deployment.
///
/// Everything here is off the request path. Failures update the record
/// and the log; they never propagate.
#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    registry: Arc<DeploymentRegistry>,
    provisioner: Arc<dyn EnvironmentProvisioner>,
    supervisor: Arc<ProcessSupervisor>,
    builder: CommandBuilder,
    request: DeployRequest,
    model: ModelSpec,
    record: DeploymentRecord,
) {
    let model_id = record.model_id.clone();

    let mut log = match DeploymentLog::open(&record.log_path).await {
        Ok(log) => log,
        Err(e) => {
            error!(model_id = %model_id, error = %e, "cannot open deployment log");
            registry.set_state(&model_id, DeployState::Failed).await;
            return;
        }
    };

    log.line(&format!(
        "Starting deployment for {model_id} on port {}",
        record.port
    ))
    .await;
    log.line(&format!("Time: {}", Utc::now().format("%Y-%m-%d %H:%M:%S")))
        .await;
    if request.use_all_gpus {
        log.line("Using all available GPUs").await;
        if let Some(size) = request.tensor_parallel_size {
            log.line(&format!("Tensor parallel size: {size}")).await;
        }
    } else {
        log.line(&format!("GPU ID: {}", request.gpu_id)).await;
    }
    log.line(&format!("Isolated environment: {}", request.isolate_env))
        .await;
    log.line("").await;

    log.line(&format!(
        "Model configuration found. Requirements: {}",
        model.dependency_spec().unwrap_or("-")
    ))
    .await;

    let env_path = if request.isolate_env {
        match provisioner
            .provision(&model_id, model.dependency_spec(), &mut log)
            .await
        {
            EnvOutcome::Isolated(path) => {
                log.line(&format!(
                    "Created isolated environment at {}",
                    path.display()
                ))
                .await;
                registry.set_env_path(&model_id, path.clone()).await;
                Some(path)
            }
            EnvOutcome::Fallback(reason) => {
                info!(model_id = %model_id, reason = %reason, "using system runtime");
                None
            }
        }
    } else {
        log.line("Using the system runtime").await;
        None
    };

    // GPU detection only matters when the worker spans all GPUs and no
    // explicit parallelism degree was given.
    let detected = if request.use_all_gpus && request.tensor_parallel_size.is_none() {
        gpu::detect_gpu_count().await
    } else {
        None
    };

    let built = builder.build(&request, &model, record.port, detected);
    for note in &built.notes {
        log.line(note).await;
    }
    registry.set_command(&model_id, built.plan.display()).await;

    supervisor
        .launch(
            &model_id,
            &built.plan,
            env_path.as_deref(),
            record.cancel.clone(),
            &mut log,
        )
        .await;
}
