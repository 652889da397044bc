//! Deployment registry.
//!
//! The registry is the single source of truth for deployment state: one
//! record per model id behind one async mutex. Every read-modify-write
//! sequence (existence check + port reservation + insert, state update,
//! delete) runs under a single lock acquisition, which is what makes the
//! duplicate-deploy guarantee hold: a deploy request for an id that is
//! already registered always observes the existing record, never a race
//! where two workers launch for one id.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::ports::PortAllocator;
use crate::state::DeployState;
use crate::supervisor::WorkerHandle;
use crate::types::DeploymentRecord;

/// Outcome of a reservation attempt.
#[derive(Debug)]
pub enum Reservation {
    /// A record for this model id already exists; nothing was inserted.
    Existing(DeploymentRecord),
    /// A new record was created with a freshly reserved port.
    Created(DeploymentRecord),
}

/// Mutex-guarded deployment store.
#[derive(Debug)]
pub struct DeploymentRegistry {
    deployments: Mutex<HashMap<String, DeploymentRecord>>,
    ports: PortAllocator,
}

impl DeploymentRegistry {
    /// Create an empty registry backed by the given port allocator.
    #[must_use]
    pub fn new(ports: PortAllocator) -> Self {
        Self {
            deployments: Mutex::new(HashMap::new()),
            ports,
        }
    }

    /// Atomically reserve a slot for `model_id`.
    ///
    /// Under one lock: if a record exists it is returned unchanged;
    /// otherwise a port is allocated (avoiding every port held by a
    /// live record) and the record produced by `build` is inserted in
    /// the `deploying` state. The allocator's host probes are awaited
    /// while the lock is held; they are bounded and sub-second.
    pub async fn reserve(
        &self,
        model_id: &str,
        requested_port: Option<u16>,
        build: impl FnOnce(u16) -> DeploymentRecord,
    ) -> ControlResult<Reservation> {
        let mut deployments = self.deployments.lock().await;

        if let Some(existing) = deployments.get(model_id) {
            return Ok(Reservation::Existing(existing.clone()));
        }

        let used: HashSet<u16> = deployments.values().map(|r| r.port).collect();
        let port = self.ports.allocate(requested_port, &used).await?;

        let record = build(port);
        deployments.insert(model_id.to_owned(), record.clone());
        Ok(Reservation::Created(record))
    }

    /// Fetch a record by model id.
    pub async fn get(&self, model_id: &str) -> Option<DeploymentRecord> {
        self.deployments.lock().await.get(model_id).cloned()
    }

    /// All records, ordered by creation time.
    pub async fn list(&self) -> Vec<DeploymentRecord> {
        let deployments = self.deployments.lock().await;
        let mut records: Vec<_> = deployments.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Transition a record's state.
    ///
    /// Transitions are monotonic: a terminal record never moves again.
    /// Returns whether the transition was applied; updates against a
    /// removed record are silently dropped (the pipeline may outlive an
    /// explicit stop).
    pub async fn set_state(&self, model_id: &str, state: DeployState) -> bool {
        let mut deployments = self.deployments.lock().await;
        match deployments.get_mut(model_id) {
            Some(record) if record.state.can_transition_to(state) => {
                record.state = state;
                record.updated_at = Utc::now();
                true
            }
            Some(record) => {
                debug!(
                    model_id,
                    from = %record.state,
                    to = %state,
                    "ignoring state transition out of a terminal state"
                );
                false
            }
            None => {
                debug!(model_id, to = %state, "state update for a removed record");
                false
            }
        }
    }

    /// Record the worker's exit code together with its terminal state.
    pub async fn record_exit(&self, model_id: &str, state: DeployState, exit_code: Option<i32>) {
        let mut deployments = self.deployments.lock().await;
        if let Some(record) = deployments.get_mut(model_id) {
            if record.state.can_transition_to(state) {
                record.state = state;
            }
            record.exit_code = exit_code;
            record.updated_at = Utc::now();
        }
    }

    /// Set the isolated environment path on a record.
    pub async fn set_env_path(&self, model_id: &str, env_path: std::path::PathBuf) {
        let mut deployments = self.deployments.lock().await;
        if let Some(record) = deployments.get_mut(model_id) {
            record.env_path = Some(env_path);
            record.updated_at = Utc::now();
        }
    }

    /// Update the recorded launch command line.
    pub async fn set_command(&self, model_id: &str, command_line: String) {
        let mut deployments = self.deployments.lock().await;
        if let Some(record) = deployments.get_mut(model_id) {
            record.command_line = command_line;
            record.updated_at = Utc::now();
        }
    }

    /// Publish the live worker handle for a record.
    pub async fn attach_worker(&self, model_id: &str, worker: WorkerHandle) {
        let mut deployments = self.deployments.lock().await;
        if let Some(record) = deployments.get_mut(model_id) {
            record.worker = Some(worker);
            record.updated_at = Utc::now();
        }
    }

    /// Remove a record, returning it.
    pub async fn remove(&self, model_id: &str) -> ControlResult<DeploymentRecord> {
        self.deployments
            .lock()
            .await
            .remove(model_id)
            .ok_or_else(|| ControlError::DeploymentNotFound(model_id.to_owned()))
    }

    /// Number of live records.
    pub async fn len(&self) -> usize {
        self.deployments.lock().await.len()
    }

    /// Whether the registry has no records.
    pub async fn is_empty(&self) -> bool {
        self.deployments.lock().await.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::PortConfig;
    use crate::types::tests::test_request;
    use crate::types::DeployRequest;

    pub(crate) fn test_registry(min: u16, max: u16) -> DeploymentRegistry {
        DeploymentRegistry::new(PortAllocator::new(&PortConfig {
            min,
            max,
            probe_timeout_ms: 100,
        }))
    }

    fn build_record(request: &DeployRequest) -> impl FnOnce(u16) -> DeploymentRecord + '_ {
        move |port| DeploymentRecord::new(request, port, "cmd".to_owned(), "test.log".into())
    }

    #[tokio::test]
    async fn reserve_then_duplicate_sees_existing() {
        let registry = test_registry(18201, 18210);
        let request = test_request("org/model-a");

        let first = registry
            .reserve("org/model-a", None, build_record(&request))
            .await
            .expect("reserve");
        let port = match first {
            Reservation::Created(record) => record.port,
            Reservation::Existing(_) => panic!("expected a new record"),
        };

        let second = registry
            .reserve("org/model-a", None, build_record(&request))
            .await
            .expect("reserve");
        match second {
            Reservation::Existing(record) => assert_eq!(record.port, port),
            Reservation::Created(_) => panic!("expected the existing record"),
        }
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn distinct_models_get_distinct_ports() {
        let registry = test_registry(18211, 18220);

        let mut ports = HashSet::new();
        for name in ["org/a", "org/b", "org/c"] {
            let request = test_request(name);
            let reservation = registry
                .reserve(name, None, build_record(&request))
                .await
                .expect("reserve");
            if let Reservation::Created(record) = reservation {
                ports.insert(record.port);
            }
        }
        assert_eq!(ports.len(), 3);
    }

    #[tokio::test]
    async fn requested_port_held_by_record_is_reassigned() {
        let registry = test_registry(18221, 18230);

        let request_a = test_request("org/a");
        let first = registry
            .reserve("org/a", Some(18225), build_record(&request_a))
            .await
            .expect("reserve");
        let Reservation::Created(record_a) = first else {
            panic!("expected a new record");
        };
        assert_eq!(record_a.port, 18225);

        let request_b = test_request("org/b");
        let second = registry
            .reserve("org/b", Some(18225), build_record(&request_b))
            .await
            .expect("reserve");
        let Reservation::Created(record_b) = second else {
            panic!("expected a new record");
        };
        assert_ne!(record_b.port, 18225);
    }

    #[tokio::test]
    async fn state_transitions_are_monotonic() {
        let registry = test_registry(18231, 18240);
        let request = test_request("org/a");
        registry
            .reserve("org/a", None, build_record(&request))
            .await
            .expect("reserve");

        assert!(registry.set_state("org/a", DeployState::Failed).await);
        assert!(!registry.set_state("org/a", DeployState::Completed).await);
        assert!(!registry.set_state("org/a", DeployState::Deploying).await);

        let record = registry.get("org/a").await.expect("record");
        assert_eq!(record.state, DeployState::Failed);
    }

    #[tokio::test]
    async fn updates_after_removal_are_dropped() {
        let registry = test_registry(18241, 18250);
        let request = test_request("org/a");
        registry
            .reserve("org/a", None, build_record(&request))
            .await
            .expect("reserve");

        registry.remove("org/a").await.expect("remove");
        assert!(!registry.set_state("org/a", DeployState::Failed).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let registry = test_registry(18251, 18260);
        let result = registry.remove("org/never-deployed").await;
        assert!(matches!(result, Err(ControlError::DeploymentNotFound(_))));
    }
}
