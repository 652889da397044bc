//! berth control plane
//!
//! This crate orchestrates the lifecycle of model-serving worker
//! processes: allocate a network port, optionally provision an isolated
//! runtime environment for the model's dependencies, derive the worker
//! launch command, spawn and supervise the child process, and track
//! everything in an in-memory deployment registry behind a small HTTP
//! API.
//!
//! # Architecture
//!
//! A deploy request flows through:
//!
//! 1. **Registry reservation** — under one lock: duplicate check, port
//!    allocation (avoiding both registry-held and host-occupied ports),
//!    record insertion in the `deploying` state. The caller gets its
//!    response here; everything below runs in a background task.
//! 2. **Environment provisioning** — best-effort virtualenv creation
//!    and dependency install; every failure falls back to the system
//!    runtime and is recorded in the deployment log.
//! 3. **Command building** — a pure derivation of the launcher argv and
//!    environment variables from the request, catalog metadata, and the
//!    detected GPU count.
//! 4. **Supervision** — the worker's combined output streams into the
//!    per-deployment log; exit codes become record state, and an
//!    explicit stop escalates from SIGTERM to SIGKILL.
//!
//! # State machine
//!
//! ```text
//! Deploying ──▶ Completed   (worker exited 0)
//!     │
//!     ├───────▶ Failed      (provision/launch error or nonzero exit)
//!     │
//!     └───────▶ Stopped     (explicit stop request)
//! ```
//!
//! While the worker process is alive the stored state stays `deploying`
//! and readers see `running`, reconciled live from the process handle.
//! Records never expire on their own; only an explicit stop removes
//! them. The registry is memory-only and does not survive a restart.

#![forbid(unsafe_code)]

pub mod api;
pub mod catalog;
pub mod command;
pub mod config;
pub mod deployment;
pub mod error;
pub mod gpu;
pub mod logfile;
pub mod ports;
pub mod provisioner;
pub mod registry;
pub mod service;
pub mod state;
pub mod supervisor;
pub mod types;

// Re-export commonly used types at the crate root
pub use catalog::{ModelCatalog, ModelSpec};
pub use config::ControlConfig;
pub use deployment::{DeployOutcome, DeploymentManager};
pub use error::{ControlError, ControlResult};
pub use ports::PortAllocator;
pub use provisioner::{EnvOutcome, EnvironmentProvisioner, VenvProvisioner};
pub use registry::{DeploymentRegistry, Reservation};
pub use service::ControlService;
pub use state::DeployState;
pub use supervisor::{ProcessSupervisor, WorkerHandle, WorkerStatus};
pub use types::{DeployRequest, DeploymentRecord};
