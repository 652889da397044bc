//! Worker process supervision.
//!
//! The supervisor spawns the worker child, publishes a [`WorkerHandle`]
//! into the registry, and waits for the outcome inside the deployment's
//! own pipeline task. The `tokio::process::Child` never leaves that
//! task: every other component observes the worker only through the
//! handle's exit channel, so nothing can double-signal or touch a
//! process after it has been reaped.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{find_launcher, LaunchPlan};
use crate::logfile::DeploymentLog;
use crate::registry::DeploymentRegistry;
use crate::state::DeployState;

/// Live status of a worker as seen through its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// The process has not exited yet.
    Running,
    /// The process exited with the given code.
    Exited(i32),
}

/// Observer-side handle to a supervised worker.
///
/// Cheap to clone; the underlying child process stays with the
/// supervising task.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pid: Option<u32>,
    exit: watch::Receiver<Option<i32>>,
}

impl WorkerHandle {
    /// OS pid of the worker, when known.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current status, reconciled from the exit channel.
    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        match *self.exit.borrow() {
            Some(code) => WorkerStatus::Exited(code),
            None => WorkerStatus::Running,
        }
    }

    /// Wait for the worker to exit, up to `timeout`.
    ///
    /// Returns the exit code, or `None` when the timeout elapsed first.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<i32> {
        let mut exit = self.exit.clone();
        let result = match tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await {
            Ok(Ok(code)) => *code,
            Ok(Err(_)) | Err(_) => None,
        };
        result
    }
}

/// Spawns and supervises worker processes.
#[derive(Debug)]
pub struct ProcessSupervisor {
    registry: Arc<DeploymentRegistry>,
    stop_timeout: Duration,
}

impl ProcessSupervisor {
    /// Create a supervisor writing outcomes into `registry`.
    #[must_use]
    pub fn new(registry: Arc<DeploymentRegistry>, stop_timeout: Duration) -> Self {
        Self {
            registry,
            stop_timeout,
        }
    }

    /// Launch the worker for `model_id` and block until it exits.
    ///
    /// Runs inside the deployment's pipeline task, never on a request
    /// handler. All failure modes end up as record state plus log
    /// content; nothing propagates.
    pub async fn launch(
        &self,
        model_id: &str,
        plan: &LaunchPlan,
        env_path: Option<&std::path::Path>,
        cancel: CancellationToken,
        log: &mut DeploymentLog,
    ) {
        if cancel.is_cancelled() {
            log.line("Stop requested before launch; worker not started")
                .await;
            self.registry.set_state(model_id, DeployState::Stopped).await;
            return;
        }

        log.line(&format!("Executing: {}", plan.display())).await;
        log.line("").await;
        log.line("=== Deployment Output ===").await;
        log.line("").await;

        let mut child = match self.spawn(plan, env_path, log).await {
            Ok(child) => child,
            Err(reason) => {
                log.line(&format!("ERROR: {reason}")).await;
                warn!(model_id, reason = %reason, "worker launch failed");
                self.registry
                    .record_exit(model_id, DeployState::Failed, None)
                    .await;
                return;
            }
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = WorkerHandle {
            pid: child.id(),
            exit: exit_rx,
        };
        self.registry.attach_worker(model_id, handle).await;
        info!(model_id, pid = ?child.id(), "worker started");

        let (state, code) = tokio::select! {
            () = cancel.cancelled() => {
                let code = self.stop_child(&mut child, log).await;
                (DeployState::Stopped, code)
            }
            status = child.wait() => match status {
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    log.line(&format!("\nProcess exited with code {code}")).await;
                    if status.success() {
                        log.line("Deployment completed successfully.").await;
                        (DeployState::Completed, code)
                    } else {
                        log.line("Deployment failed. Check error messages above.")
                            .await;
                        (DeployState::Failed, code)
                    }
                }
                Err(e) => {
                    log.line(&format!("ERROR: waiting on worker failed: {e}")).await;
                    (DeployState::Failed, -1)
                }
            },
        };

        self.registry.record_exit(model_id, state, Some(code)).await;
        let _ = exit_tx.send(Some(code));
        info!(model_id, code, state = %state, "worker finished");
    }

    /// Spawn the worker with its combined output appended to the log.
    async fn spawn(
        &self,
        plan: &LaunchPlan,
        env_path: Option<&std::path::Path>,
        log: &mut DeploymentLog,
    ) -> Result<Child, String> {
        let stdout = log
            .std_handle()
            .map_err(|e| format!("cannot open log for worker output: {e}"))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| format!("cannot clone log handle: {e}"))?;

        let program = find_launcher(&plan.program);
        let mut cmd = Command::new(&program);
        cmd.args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        for (key, value) in &plan.env {
            cmd.env(key, value);
        }

        // An isolated environment takes effect through PATH: the
        // launcher and its interpreter resolve inside the env.
        if let Some(env_path) = env_path {
            let bin = env_path.join("bin");
            let path = std::env::var("PATH").unwrap_or_default();
            cmd.env("PATH", format!("{}:{path}", bin.display()));
            log.line(&format!("Using isolated environment PATH: {}", bin.display()))
                .await;
        }

        cmd.spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", program.display()))
    }

    /// Graceful termination: SIGTERM, a bounded wait, then SIGKILL.
    async fn stop_child(&self, child: &mut Child, log: &mut DeploymentLog) -> i32 {
        log.line("\nStop requested; terminating worker").await;

        if let Some(pid) = child.id() {
            send_sigterm(pid);
        }

        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let code = status.code().unwrap_or(-1);
                log.line(&format!("Worker exited with code {code} after terminate"))
                    .await;
                code
            }
            Ok(Err(e)) => {
                log.line(&format!("ERROR: waiting on worker failed: {e}")).await;
                -1
            }
            Err(_) => {
                log.line(&format!(
                    "Worker did not exit within {}s; killing",
                    self.stop_timeout.as_secs()
                ))
                .await;
                if let Err(e) = child.kill().await {
                    log.line(&format!("ERROR: kill failed: {e}")).await;
                }
                -1
            }
        }
    }
}

/// Send SIGTERM to a process by pid.
fn send_sigterm(pid: u32) {
    match i32::try_from(pid) {
        Ok(pid) => {
            if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
        }
        Err(_) => debug!(pid, "pid out of range for SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_registry;
    use crate::types::tests::test_request;
    use crate::types::DeploymentRecord;

    fn shell_plan(script: &str) -> LaunchPlan {
        LaunchPlan {
            program: "sh".to_owned(),
            args: vec!["-c".to_owned(), script.to_owned()],
            env: Vec::new(),
        }
    }

    async fn registered(
        registry: &Arc<DeploymentRegistry>,
        model_id: &str,
        log_path: &std::path::Path,
    ) -> DeploymentRecord {
        let request = test_request(model_id);
        let reservation = registry
            .reserve(model_id, None, |port| {
                DeploymentRecord::new(&request, port, "cmd".to_owned(), log_path.to_path_buf())
            })
            .await
            .expect("reserve");
        match reservation {
            crate::registry::Reservation::Created(record) => record,
            crate::registry::Reservation::Existing(_) => panic!("expected a new record"),
        }
    }

    #[tokio::test]
    async fn clean_exit_is_completed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("ok.log");
        let registry = Arc::new(test_registry(18301, 18310));
        let record = registered(&registry, "org/ok", &log_path).await;

        let supervisor = ProcessSupervisor::new(Arc::clone(&registry), Duration::from_secs(5));
        let mut log = DeploymentLog::open(&log_path).await.expect("log");
        supervisor
            .launch(
                "org/ok",
                &shell_plan("echo worker output; exit 0"),
                None,
                record.cancel.clone(),
                &mut log,
            )
            .await;

        let record = registry.get("org/ok").await.expect("record");
        assert_eq!(record.state, DeployState::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.display_status(), "completed");

        let content = tokio::fs::read_to_string(&log_path).await.expect("read");
        assert!(content.contains("worker output"));
        assert!(content.contains("Process exited with code 0"));
        assert!(content.contains("Deployment completed successfully."));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("fail.log");
        let registry = Arc::new(test_registry(18311, 18320));
        let record = registered(&registry, "org/fail", &log_path).await;

        let supervisor = ProcessSupervisor::new(Arc::clone(&registry), Duration::from_secs(5));
        let mut log = DeploymentLog::open(&log_path).await.expect("log");
        supervisor
            .launch(
                "org/fail",
                &shell_plan("exit 3"),
                None,
                record.cancel.clone(),
                &mut log,
            )
            .await;

        let record = registry.get("org/fail").await.expect("record");
        assert_eq!(record.state, DeployState::Failed);
        assert_eq!(record.exit_code, Some(3));

        let content = tokio::fs::read_to_string(&log_path).await.expect("read");
        assert!(content.contains("Process exited with code 3"));
        assert!(content.contains("Deployment failed."));
    }

    #[tokio::test]
    async fn spawn_failure_is_failed_without_a_handle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("nospawn.log");
        let registry = Arc::new(test_registry(18321, 18330));
        let record = registered(&registry, "org/nospawn", &log_path).await;

        let plan = LaunchPlan {
            program: "/nonexistent/launcher".to_owned(),
            args: vec!["deploy".to_owned()],
            env: Vec::new(),
        };

        let supervisor = ProcessSupervisor::new(Arc::clone(&registry), Duration::from_secs(5));
        let mut log = DeploymentLog::open(&log_path).await.expect("log");
        supervisor
            .launch("org/nospawn", &plan, None, record.cancel.clone(), &mut log)
            .await;

        let record = registry.get("org/nospawn").await.expect("record");
        assert_eq!(record.state, DeployState::Failed);
        assert!(record.worker.is_none());

        let content = tokio::fs::read_to_string(&log_path).await.expect("read");
        assert!(content.contains("ERROR: failed to spawn"));
    }

    #[tokio::test]
    async fn stop_terminates_a_running_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("stop.log");
        let registry = Arc::new(test_registry(18331, 18340));
        let record = registered(&registry, "org/long", &log_path).await;
        let cancel = record.cancel.clone();

        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&registry),
            Duration::from_secs(5),
        ));
        let task = {
            let supervisor = Arc::clone(&supervisor);
            let cancel = cancel.clone();
            let log_path = log_path.clone();
            tokio::spawn(async move {
                let mut log = DeploymentLog::open(&log_path).await.expect("log");
                supervisor
                    .launch("org/long", &shell_plan("sleep 30"), None, cancel, &mut log)
                    .await;
            })
        };

        // Wait until the handle is published and the worker reports running.
        let mut running = false;
        for _ in 0..50 {
            if let Some(record) = registry.get("org/long").await {
                if record.display_status() == "running" {
                    running = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(running, "worker never reported running");

        cancel.cancel();
        task.await.expect("supervisor task");

        let record = registry.get("org/long").await.expect("record");
        assert_eq!(record.state, DeployState::Stopped);
        assert!(record.worker.is_some());

        let content = tokio::fs::read_to_string(&log_path).await.expect("read");
        assert!(content.contains("Stop requested; terminating worker"));
    }

    #[tokio::test]
    async fn cancelled_before_launch_never_spawns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("prestop.log");
        let registry = Arc::new(test_registry(18341, 18350));
        let record = registered(&registry, "org/prestop", &log_path).await;

        record.cancel.cancel();

        let supervisor = ProcessSupervisor::new(Arc::clone(&registry), Duration::from_secs(5));
        let mut log = DeploymentLog::open(&log_path).await.expect("log");
        supervisor
            .launch(
                "org/prestop",
                &shell_plan("sleep 30"),
                None,
                record.cancel.clone(),
                &mut log,
            )
            .await;

        let record = registry.get("org/prestop").await.expect("record");
        assert_eq!(record.state, DeployState::Stopped);
        assert!(record.worker.is_none());
    }
}
