//! Virtualenv-based environment provisioning.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::EnvConfig;
use crate::logfile::DeploymentLog;

use super::{EnvOutcome, EnvironmentProvisioner};

/// Provisions one virtualenv per model under a base directory.
///
/// Environments inherit the host's globally installed packages
/// (`--system-site-packages`) so the large pre-installed ML frameworks
/// are not re-downloaded per model; only the model's own dependency
/// spec is installed on top.
#[derive(Debug, Clone)]
pub struct VenvProvisioner {
    base_dir: PathBuf,
    python_bin: String,
    versioned_python_bin: String,
}

impl VenvProvisioner {
    /// Create a provisioner from the environments configuration.
    #[must_use]
    pub fn new(config: &EnvConfig) -> Self {
        Self {
            base_dir: config.base_dir.clone(),
            python_bin: config.python_bin.clone(),
            versioned_python_bin: config.versioned_python_bin.clone(),
        }
    }

    /// Directory name for a model's environment.
    fn env_dir_name(model_id: &str) -> String {
        format!(
            "env_{}",
            model_id.replace('/', "_").replace('-', "_").to_lowercase()
        )
    }

    async fn try_provision(
        &self,
        model_id: &str,
        dependency_spec: Option<&str>,
        log: &mut DeploymentLog,
    ) -> Result<PathBuf, String> {
        let env_path = self.base_dir.join(Self::env_dir_name(model_id));

        log.line(&format!(
            "Ensuring base environments directory exists: {}",
            self.base_dir.display()
        ))
        .await;
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| format!("cannot create {}: {e}", self.base_dir.display()))?;

        log.line(&format!(
            "Creating isolated environment for {model_id} at {}",
            env_path.display()
        ))
        .await;

        let mut create = Command::new(&self.python_bin);
        create
            .args(["-m", "venv", "--system-site-packages"])
            .arg(&env_path);
        if let Err(reason) = run_step(&self.python_bin, "-m venv", create, log).await {
            log.line(&format!("{reason}; retrying with {}", self.versioned_python_bin))
                .await;
            let mut retry = Command::new(&self.versioned_python_bin);
            retry
                .args(["-m", "venv", "--system-site-packages"])
                .arg(&env_path);
            run_step(&self.versioned_python_bin, "-m venv", retry, log).await?;
        }

        let pip = env_path.join("bin").join("pip");
        let mut upgrade = Command::new(&pip);
        upgrade.args(["install", "--upgrade", "pip", "wheel"]);
        run_step("pip", "install --upgrade pip wheel", upgrade, log).await?;

        match dependency_spec {
            Some(spec) => {
                log.line(&format!("Processing requirements: {spec}")).await;
                let parsed = parse_dependency_spec(spec);
                if parsed.used_fallback {
                    log.line("Requirement tokenisation failed; falling back to whitespace splitting")
                        .await;
                }
                if parsed.packages.is_empty() {
                    log.line("No requirements to install after parsing").await;
                } else {
                    let mut install = Command::new(&pip);
                    install.arg("install").args(&parsed.packages);
                    if let Some(flag) = &parsed.upgrade_flag {
                        install.arg(flag);
                    }
                    let what = format!(
                        "install {}{}",
                        parsed.packages.join(" "),
                        parsed
                            .upgrade_flag
                            .as_deref()
                            .map(|f| format!(" {f}"))
                            .unwrap_or_default()
                    );
                    run_step("pip", &what, install, log).await?;
                }
            }
            None => {
                log.line("No requirements specified for this model").await;
            }
        }

        log.line(&format!(
            "Successfully created isolated environment at {}",
            env_path.display()
        ))
        .await;
        Ok(env_path)
    }
}

#[async_trait]
impl EnvironmentProvisioner for VenvProvisioner {
    async fn provision(
        &self,
        model_id: &str,
        dependency_spec: Option<&str>,
        log: &mut DeploymentLog,
    ) -> EnvOutcome {
        match self.try_provision(model_id, dependency_spec, log).await {
            Ok(env_path) => EnvOutcome::Isolated(env_path),
            Err(reason) => {
                warn!(model_id, reason = %reason, "environment provisioning failed");
                log.line(&format!("ERROR: {reason}")).await;
                log.line("Falling back to the system runtime").await;
                EnvOutcome::Fallback(reason)
            }
        }
    }
}

/// A tokenised dependency spec.
#[derive(Debug, PartialEq, Eq)]
struct ParsedSpec {
    /// Package tokens to install.
    packages: Vec<String>,
    /// The upgrade flag exactly as found in the spec, if any.
    upgrade_flag: Option<String>,
    /// Whether tokenisation fell back to whitespace splitting.
    used_fallback: bool,
}

/// Tokenise a dependency spec with shell-word semantics.
///
/// Quoted version constraints like `"torch>=2.0"` survive as single
/// tokens, and `-U`/`--upgrade` is lifted out of the token stream. When
/// tokenisation itself fails the spec is split on whitespace verbatim.
fn parse_dependency_spec(spec: &str) -> ParsedSpec {
    match shell_words::split(spec) {
        Ok(mut tokens) => {
            let upgrade_flag = tokens
                .iter()
                .position(|t| t == "-U" || t == "--upgrade")
                .map(|i| tokens.remove(i));
            ParsedSpec {
                packages: tokens,
                upgrade_flag,
                used_fallback: false,
            }
        }
        Err(e) => {
            debug!(error = %e, "shell-word tokenisation failed");
            ParsedSpec {
                packages: spec.split_whitespace().map(str::to_owned).collect(),
                upgrade_flag: None,
                used_fallback: true,
            }
        }
    }
}

/// Run one provisioning step, appending its output to the log.
async fn run_step(
    program: &(impl std::fmt::Display + ?Sized),
    what: &str,
    mut cmd: Command,
    log: &mut DeploymentLog,
) -> Result<(), String> {
    log.line(&format!("Running: {program} {what}")).await;

    let output = cmd
        .output()
        .await
        .map_err(|e| format!("failed to run {program} {what}: {e}"))?;

    if !output.stdout.is_empty() {
        log.raw(&String::from_utf8_lossy(&output.stdout)).await;
    }
    if !output.stderr.is_empty() {
        log.raw(&String::from_utf8_lossy(&output.stderr)).await;
    }

    if output.status.success() {
        log.line(&format!("Completed: {program} {what}")).await;
        Ok(())
    } else {
        Err(format!("{program} {what} exited with {}", output.status))
    }
}
