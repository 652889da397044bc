//! Deployment orchestration.

mod manager;

pub use manager::{DeployOutcome, DeploymentManager};
