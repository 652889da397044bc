//! Per-deployment log files.
//!
//! Each deployment owns exactly one append-only log capturing the
//! provisioning narration and the worker's combined stdout/stderr. The
//! file is opened in append mode so the control plane and the worker
//! child (which gets its own handles, see the supervisor) can both write
//! without clobbering each other.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Append-only log for one deployment.
#[derive(Debug)]
pub struct DeploymentLog {
    path: PathBuf,
    file: tokio::fs::File,
}

impl DeploymentLog {
    /// Open (creating if needed) the log at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { path, file })
    }

    /// Deterministic log file name for a deployment.
    #[must_use]
    pub fn file_name(model_id: &str, port: u16) -> String {
        format!("deployment_{}_{port}.log", model_id.replace('/', "_"))
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Best-effort: the log must never take a
    /// deployment down with it.
    pub async fn line(&mut self, msg: &str) {
        let buf = format!("{msg}\n");
        if let Err(e) = self.file.write_all(buf.as_bytes()).await {
            debug!(path = %self.path.display(), error = %e, "log write failed");
        }
        let _ = self.file.flush().await;
    }

    /// Append raw text without a trailing newline.
    pub async fn raw(&mut self, text: &str) {
        if let Err(e) = self.file.write_all(text.as_bytes()).await {
            debug!(path = %self.path.display(), error = %e, "log write failed");
        }
        let _ = self.file.flush().await;
    }

    /// A std file handle in append mode, suitable for handing to a
    /// child process as stdout/stderr.
    pub fn std_handle(&self) -> std::io::Result<std::fs::File> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_replaces_slashes() {
        assert_eq!(
            DeploymentLog::file_name("Qwen/Qwen2-VL-7B-Instruct", 8500),
            "deployment_Qwen_Qwen2-VL-7B-Instruct_8500.log"
        );
    }

    #[tokio::test]
    async fn lines_accumulate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.log");

        let mut log = DeploymentLog::open(&path).await.expect("open");
        log.line("first").await;
        log.line("second").await;

        let content = tokio::fs::read_to_string(&path).await.expect("read");
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn std_handle_appends_alongside_async_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mixed.log");

        let mut log = DeploymentLog::open(&path).await.expect("open");
        log.line("from control plane").await;

        use std::io::Write as _;
        let mut handle = log.std_handle().expect("handle");
        writeln!(handle, "from worker").expect("write");
        drop(handle);

        log.line("back to control plane").await;

        let content = tokio::fs::read_to_string(&path).await.expect("read");
        assert_eq!(
            content,
            "from control plane\nfrom worker\nback to control plane\n"
        );
    }
}
