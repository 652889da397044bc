//! Deployment state machine.
//!
//! A record starts in `deploying` and moves exactly once into one of the
//! terminal states:
//!
//! ```text
//! Deploying ──▶ Completed   (worker exited 0)
//!     │
//!     ├───────▶ Failed      (provision/launch error or nonzero exit)
//!     │
//!     └───────▶ Stopped     (explicit stop request)
//! ```
//!
//! "running" is not a stored state: while the worker process is alive the
//! record stays in `deploying` and the live status is reconciled from the
//! process handle at read time (see `DeploymentRecord::display_status`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stored lifecycle state of a deployment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    /// Pipeline in flight or worker process alive.
    Deploying,
    /// Worker exited with code 0.
    Completed,
    /// Provisioning/launch error or nonzero worker exit.
    Failed,
    /// Explicitly stopped by request.
    Stopped,
}

impl DeployState {
    /// Get the state name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deploying => "deploying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Check whether the state is terminal (no further transitions).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Check whether a transition to `next` is allowed.
    ///
    /// Transitions are monotonic: once a record reaches a terminal state
    /// it never moves again (it can only be deleted and recreated).
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Deploying => !matches!(next, Self::Deploying),
            _ => false,
        }
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeployState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploying" => Ok(Self::Deploying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("unknown deployment state: {s}")),
        }
    }
}
