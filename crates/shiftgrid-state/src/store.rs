//! StateStore — redb-backed persistence for ShiftGrid.
//!
//! Provides typed CRUD operations over rollouts, workloads, and pod
//! observations. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).
//!
//! Rollouts and workloads carry a `resource_version` token; writes are
//! compare-and-swap against it. Two writers race on the same rollout
//! status (the convergence engine and the step scheduler), so a stale
//! write is rejected with [`StateError::Conflict`] instead of silently
//! clobbering the newer record.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.open_table(PODS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Rollouts ──────────────────────────────────────────────────

    /// Get a rollout by identity.
    pub fn get_rollout(&self, id: &RolloutId) -> StateResult<Option<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(id.key().as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let rollout: Rollout =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(rollout))
            }
            None => Ok(None),
        }
    }

    /// List all rollouts.
    pub fn list_rollouts(&self) -> StateResult<Vec<Rollout>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let rollout: Rollout =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(rollout);
        }
        Ok(results)
    }

    /// Insert or update a rollout, checking `meta.resource_version`
    /// against the stored record. Returns the new version.
    pub fn put_rollout(&self, rollout: &Rollout) -> StateResult<u64> {
        let key = rollout.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let version = rollout.meta.resource_version + 1;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            check_version(&table, &key, rollout.meta.resource_version)?;
            let mut updated = rollout.clone();
            updated.meta.resource_version = version;
            let value = serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, version, "rollout stored");
        Ok(version)
    }

    /// Update only the status block of a stored rollout, version-checked.
    /// The stored spec and metadata win. Returns the new version.
    pub fn put_rollout_status(&self, rollout: &Rollout) -> StateResult<u64> {
        let key = rollout.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let version;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut stored = match read_record::<Rollout>(&table, &key)? {
                Some(r) => r,
                None => return Err(StateError::NotFound(key)),
            };
            if stored.meta.resource_version != rollout.meta.resource_version {
                return Err(StateError::Conflict {
                    key,
                    expected: rollout.meta.resource_version,
                    stored: stored.meta.resource_version,
                });
            }
            version = stored.meta.resource_version + 1;
            stored.status = rollout.status.clone();
            stored.meta.resource_version = version;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, version, "rollout status stored");
        Ok(version)
    }

    /// Delete a rollout by identity, checking `expected` against the
    /// stored version like every other write. Returns true if it existed.
    pub fn delete_rollout(&self, id: &RolloutId, expected: u64) -> StateResult<bool> {
        let key = id.key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            check_version(&table, &key, expected)?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "rollout deleted");
        Ok(existed)
    }

    // ── Workloads ─────────────────────────────────────────────────

    /// Get a workload by namespace/name.
    pub fn get_workload(&self, namespace: &str, name: &str) -> StateResult<Option<Workload>> {
        let key = format!("{namespace}/{name}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let workload: Workload =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(workload))
            }
            None => Ok(None),
        }
    }

    /// Insert or update a workload, checking `resource_version` against
    /// the stored record. Returns the new version.
    pub fn put_workload(&self, workload: &Workload) -> StateResult<u64> {
        let key = workload.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let version = workload.resource_version + 1;
        {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            if let Some(stored) = read_record::<Workload>(&table, &key)? {
                if stored.resource_version != workload.resource_version {
                    return Err(StateError::Conflict {
                        key,
                        expected: workload.resource_version,
                        stored: stored.resource_version,
                    });
                }
            }
            let mut updated = workload.clone();
            updated.resource_version = version;
            let value = serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, version, "workload stored");
        Ok(version)
    }

    // ── Pods ──────────────────────────────────────────────────────

    /// Insert or update a pod observation. Pods are read-only signals
    /// for this system, so there is no version check.
    pub fn put_pod(&self, pod: &PodObservation) -> StateResult<()> {
        let key = pod.table_key();
        let value = serde_json::to_vec(pod).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PODS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List pods in a namespace whose labels satisfy the selector.
    pub fn list_pods(
        &self,
        namespace: &str,
        selector: &std::collections::BTreeMap<String, String>,
    ) -> StateResult<Vec<PodObservation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PODS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let pod: PodObservation =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if pod.namespace == namespace && pod.matches_selector(selector) {
                results.push(pod);
            }
        }
        Ok(results)
    }
}

/// Read and deserialize one record from an open table.
fn read_record<T: serde::de::DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let record = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Reject a write whose expected version differs from the stored one.
fn check_version(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
    expected: u64,
) -> StateResult<()> {
    if let Some(stored) = read_record::<Rollout>(table, key)? {
        if stored.meta.resource_version != expected {
            return Err(StateError::Conflict {
                key: key.to_string(),
                expected,
                stored: stored.meta.resource_version,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_rollout() -> Rollout {
        Rollout {
            namespace: "prod".into(),
            name: "shift-a".into(),
            meta: ObjectMeta::default(),
            spec: RolloutSpec {
                old_workload: "api-v1".into(),
                new_workload: "api-v2".into(),
                total_capacity: 100,
                step_capacity: 20,
                schedule: "*/5 * * * *".into(),
                rollback_enabled: true,
            },
            status: RolloutStatus::default(),
        }
    }

    fn sample_workload(name: &str) -> Workload {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), name.to_string());
        Workload {
            namespace: "prod".into(),
            name: name.into(),
            capacity: 0,
            selector,
            owner_links: Vec::new(),
            resource_version: 0,
        }
    }

    #[test]
    fn rollout_round_trip_bumps_version() {
        let store = StateStore::open_in_memory().unwrap();
        let rollout = sample_rollout();

        let v1 = store.put_rollout(&rollout).unwrap();
        assert_eq!(v1, 1);

        let fetched = store.get_rollout(&rollout.id()).unwrap().unwrap();
        assert_eq!(fetched.meta.resource_version, 1);
        assert_eq!(fetched.spec, rollout.spec);

        let v2 = store.put_rollout(&fetched).unwrap();
        assert_eq!(v2, 2);
    }

    #[test]
    fn stale_rollout_write_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let rollout = sample_rollout();
        store.put_rollout(&rollout).unwrap();

        // Writer A and writer B both read version 1.
        let a = store.get_rollout(&rollout.id()).unwrap().unwrap();
        let b = store.get_rollout(&rollout.id()).unwrap().unwrap();

        store.put_rollout(&a).unwrap();
        let err = store.put_rollout(&b).unwrap_err();
        assert!(matches!(err, StateError::Conflict { .. }));
    }

    #[test]
    fn status_write_preserves_spec_and_meta() {
        let store = StateStore::open_in_memory().unwrap();
        let mut rollout = sample_rollout();
        rollout.meta.annotations.insert("k".into(), "v".into());
        store.put_rollout(&rollout).unwrap();

        let mut fetched = store.get_rollout(&rollout.id()).unwrap().unwrap();
        fetched.status.current_step = 3;
        fetched.status.state = RolloutState::Running;
        // Local spec mutation must not leak through a status write.
        fetched.spec.total_capacity = 9999;
        store.put_rollout_status(&fetched).unwrap();

        let stored = store.get_rollout(&rollout.id()).unwrap().unwrap();
        assert_eq!(stored.status.current_step, 3);
        assert_eq!(stored.status.state, RolloutState::Running);
        assert_eq!(stored.spec.total_capacity, 100);
        assert_eq!(stored.meta.annotations.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn status_write_requires_existing_record() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.put_rollout_status(&sample_rollout()).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn stale_workload_write_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let workload = sample_workload("api-v1");
        store.put_workload(&workload).unwrap();

        let stale = workload.clone(); // still version 0
        let err = store.put_workload(&stale).unwrap_err();
        assert!(matches!(err, StateError::Conflict { .. }));
    }

    #[test]
    fn pods_filter_by_namespace_and_selector() {
        let store = StateStore::open_in_memory().unwrap();
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "api-v2".to_string());

        store
            .put_pod(&PodObservation {
                namespace: "prod".into(),
                name: "api-v2-1".into(),
                labels: labels.clone(),
                restart_counts: vec![0],
            })
            .unwrap();
        store
            .put_pod(&PodObservation {
                namespace: "staging".into(),
                name: "api-v2-2".into(),
                labels: labels.clone(),
                restart_counts: vec![1],
            })
            .unwrap();

        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "api-v2".to_string());
        let pods = store.list_pods("prod", &selector).unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].name, "api-v2-1");
    }

    #[test]
    fn delete_rollout_removes_record() {
        let store = StateStore::open_in_memory().unwrap();
        let rollout = sample_rollout();
        let version = store.put_rollout(&rollout).unwrap();

        assert!(store.delete_rollout(&rollout.id(), version).unwrap());
        assert!(!store.delete_rollout(&rollout.id(), version).unwrap());
        assert!(store.get_rollout(&rollout.id()).unwrap().is_none());
    }

    #[test]
    fn stale_delete_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let rollout = sample_rollout();
        store.put_rollout(&rollout).unwrap();

        // A concurrent write bumps the version past the deleter's copy.
        let fetched = store.get_rollout(&rollout.id()).unwrap().unwrap();
        store.put_rollout(&fetched).unwrap();

        let err = store.delete_rollout(&rollout.id(), 1).unwrap_err();
        assert!(matches!(err, StateError::Conflict { .. }));
        assert!(store.get_rollout(&rollout.id()).unwrap().is_some());
    }

    #[test]
    fn on_disk_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shiftgrid.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.put_rollout(&sample_rollout()).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let fetched = store
            .get_rollout(&RolloutId::new("prod", "shift-a"))
            .unwrap();
        assert!(fetched.is_some());
    }
}
