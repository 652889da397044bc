//! Host GPU detection.

use tokio::process::Command;
use tracing::debug;

/// Count the GPUs visible on the host.
///
/// Shells out to `nvidia-smi`; any failure (missing binary, nonzero
/// exit, empty output) yields `None` and the caller falls back to its
/// configured default visibility list.
pub async fn detect_gpu_count() -> Option<u32> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            debug!(error = %e, "nvidia-smi not runnable");
            return None;
        }
    };

    if !output.status.success() {
        debug!(status = %output.status, "nvidia-smi exited nonzero");
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let count = stdout.lines().filter(|l| !l.trim().is_empty()).count();
    if count == 0 {
        return None;
    }
    u32::try_from(count).ok()
}
