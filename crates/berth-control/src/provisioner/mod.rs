//! Isolated runtime environment provisioning.
//!
//! Provisioning is best-effort by contract: every failure, at any step,
//! degrades to the shared system runtime. The outcome is a tagged value
//! rather than an error so the fallback is visible at the type level and
//! nothing here can take a deployment down.

mod venv;

pub use venv::VenvProvisioner;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::logfile::DeploymentLog;

/// Result of a provisioning attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOutcome {
    /// A usable isolated environment rooted at the given path.
    Isolated(PathBuf),
    /// Provisioning gave up; the system runtime will be used. The
    /// reason has already been written to the deployment log.
    Fallback(String),
}

/// Trait for environment provisioning implementations.
#[async_trait]
pub trait EnvironmentProvisioner: Send + Sync {
    /// Provision an isolated environment for `model_id`.
    ///
    /// Never fails: every error path returns [`EnvOutcome::Fallback`]
    /// after recording what happened in the deployment log.
    async fn provision(
        &self,
        model_id: &str,
        dependency_spec: Option<&str>,
        log: &mut DeploymentLog,
    ) -> EnvOutcome;
}

/// Mock provisioner for testing.
#[derive(Debug, Default)]
pub struct MockProvisioner {
    env_path: Option<PathBuf>,
}

impl MockProvisioner {
    /// A mock that always reports an isolated environment at `path`.
    #[must_use]
    pub fn isolated(path: impl Into<PathBuf>) -> Self {
        Self {
            env_path: Some(path.into()),
        }
    }

    /// A mock that always falls back to the system runtime.
    #[must_use]
    pub fn fallback() -> Self {
        Self { env_path: None }
    }
}

#[async_trait]
impl EnvironmentProvisioner for MockProvisioner {
    async fn provision(
        &self,
        model_id: &str,
        _dependency_spec: Option<&str>,
        log: &mut DeploymentLog,
    ) -> EnvOutcome {
        match &self.env_path {
            Some(path) => {
                log.line(&format!(
                    "Created isolated environment for {model_id} at {}",
                    path.display()
                ))
                .await;
                EnvOutcome::Isolated(path.clone())
            }
            None => {
                log.line("Mock provisioner fallback").await;
                EnvOutcome::Fallback("mock fallback".to_owned())
            }
        }
    }
}
