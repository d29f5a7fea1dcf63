//! WorkloadGateway — the narrow read/write surface the convergence
//! engine and step scheduler consume.
//!
//! The trait is the seam where a real cluster adapter would plug in.
//! [`StoreGateway`] implements it over the embedded [`StateStore`] and is
//! what the daemon and the tests use. Gateway calls are expected to carry
//! their own bounded timeouts; a failed call surfaces as a retryable
//! error to the calling step.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::error::StateError;
use crate::store::StateStore;
use crate::types::{PodObservation, Rollout, RolloutId, Workload};

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors surfaced by gateway operations.
///
/// A `Conflict` means the record changed since it was read; callers treat
/// it as transient and retry on their next trigger. Everything else is a
/// generic I/O failure.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("version conflict: {0}")]
    Conflict(String),

    #[error("gateway i/o error: {0}")]
    Io(String),
}

impl From<StateError> for GatewayError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Conflict { .. } => GatewayError::Conflict(err.to_string()),
            other => GatewayError::Io(other.to_string()),
        }
    }
}

/// Read/write access to rollouts, workloads, and pod observations.
#[async_trait]
pub trait WorkloadGateway: Send + Sync {
    /// Fetch a rollout by identity. Absent is not an error.
    async fn get_rollout(&self, id: &RolloutId) -> GatewayResult<Option<Rollout>>;

    /// Fetch a workload by namespace and name. Absent is not an error.
    async fn get_workload(&self, namespace: &str, name: &str) -> GatewayResult<Option<Workload>>;

    /// List pods in a namespace whose labels satisfy the selector.
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> GatewayResult<Vec<PodObservation>>;

    /// Persist a workload (capacity and ownership links), version-checked.
    async fn update_workload(&self, workload: &Workload) -> GatewayResult<()>;

    /// Persist a rollout's spec and metadata, version-checked. When the
    /// rollout is marked for deletion and no finalizers remain, the
    /// record is removed from the store instead.
    async fn update_rollout(&self, rollout: &Rollout) -> GatewayResult<()>;

    /// Persist only a rollout's status block, version-checked.
    async fn update_rollout_status(&self, rollout: &Rollout) -> GatewayResult<()>;
}

/// Shared handle to a gateway implementation.
pub type SharedGateway = Arc<dyn WorkloadGateway>;

/// Gateway backed by the embedded state store.
#[derive(Clone)]
pub struct StoreGateway {
    store: StateStore,
}

impl StoreGateway {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl WorkloadGateway for StoreGateway {
    async fn get_rollout(&self, id: &RolloutId) -> GatewayResult<Option<Rollout>> {
        Ok(self.store.get_rollout(id)?)
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> GatewayResult<Option<Workload>> {
        Ok(self.store.get_workload(namespace, name)?)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> GatewayResult<Vec<PodObservation>> {
        Ok(self.store.list_pods(namespace, selector)?)
    }

    async fn update_workload(&self, workload: &Workload) -> GatewayResult<()> {
        self.store.put_workload(workload)?;
        Ok(())
    }

    async fn update_rollout(&self, rollout: &Rollout) -> GatewayResult<()> {
        if rollout.marked_for_deletion() && rollout.meta.finalizers.is_empty() {
            // Last finalizer gone: the write finalizes deletion. The
            // removal is version-checked so a stale copy cannot delete
            // over a concurrent write.
            self.store
                .delete_rollout(&rollout.id(), rollout.meta.resource_version)?;
            debug!(id = %rollout.id(), "rollout removed after finalizer cleanup");
            return Ok(());
        }
        self.store.put_rollout(rollout)?;
        Ok(())
    }

    async fn update_rollout_status(&self, rollout: &Rollout) -> GatewayResult<()> {
        self.store.put_rollout_status(rollout)?;
        Ok(())
    }
}
