//! Domain types for the ShiftGrid state store.
//!
//! These types represent the persisted state of a rollout: the declared
//! intent (capacity split, step size, cron schedule, rollback policy),
//! its observed status, the two managed workloads, and read-only pod
//! observations. All types are serializable to/from JSON for storage.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Annotation key carrying a one-shot imperative command.
pub const ANNOTATION_COMMAND: &str = "shiftgrid.dev/command";

/// Annotation key stamped with the time of the last scheduled step advance.
pub const ANNOTATION_LAST_ADVANCE: &str = "shiftgrid.dev/last-advance";

/// Finalizer marker that blocks rollout removal until ownership links
/// on both workloads have been severed.
pub const ROLLOUT_FINALIZER: &str = "shiftgrid.dev/finalizer";

/// Ownership link kind recorded on managed workloads.
pub const LINK_KIND_ROLLOUT: &str = "Rollout";

// ── Identity ──────────────────────────────────────────────────────

/// Namespace-scoped identity of a rollout. Doubles as the store table
/// key and the step scheduler's registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RolloutId {
    pub namespace: String,
    pub name: String,
}

impl RolloutId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Composite key for store tables.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for RolloutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ── Rollout ───────────────────────────────────────────────────────

/// Record metadata shared by versioned objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Optimistic concurrency token, bumped by the store on every write.
    pub resource_version: u64,
    /// Finalizer markers blocking removal from the store.
    pub finalizers: Vec<String>,
    /// RFC 3339 timestamp set when the object is marked for deletion.
    pub deletion_timestamp: Option<String>,
    /// Free-form annotations (command marker, last-advance stamp).
    pub annotations: BTreeMap<String, String>,
}

/// Declared intent: shift `total_capacity` units from the old workload to
/// the new one, `step_capacity` at a time, on a cron cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutSpec {
    /// Name of the workload to shift capacity away from.
    pub old_workload: String,
    /// Name of the workload to shift capacity onto.
    pub new_workload: String,
    /// Combined capacity across both workloads.
    pub total_capacity: u32,
    /// Capacity moved per step. Must be > 0 and divide `total_capacity`.
    pub step_capacity: u32,
    /// 5-field cron expression driving step advancement.
    pub schedule: String,
    /// Whether crash detection may roll the shift back automatically.
    pub rollback_enabled: bool,
}

/// Observed status of a rollout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolloutStatus {
    /// Mirror of the old workload's live capacity.
    pub old_capacity: u32,
    /// Mirror of the new workload's live capacity.
    pub new_capacity: u32,
    /// Number of steps taken so far (0 ..= total/step).
    pub current_step: u32,
    pub state: RolloutState,
    pub message: String,
}

/// Lifecycle state of a rollout. Unrecognized values decode as `Pending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum RolloutState {
    #[default]
    Pending,
    Running,
    Error,
    Stopped,
    Complete,
}

impl From<String> for RolloutState {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "running" => Self::Running,
            "error" => Self::Error,
            "stopped" => Self::Stopped,
            "complete" => Self::Complete,
            // "pending" and anything unrecognized.
            _ => Self::Pending,
        }
    }
}

/// The rollout intent object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub namespace: String,
    pub name: String,
    pub meta: ObjectMeta,
    pub spec: RolloutSpec,
    pub status: RolloutStatus,
}

impl Rollout {
    pub fn id(&self) -> RolloutId {
        RolloutId::new(&self.namespace, &self.name)
    }

    /// Composite key for the rollouts table.
    pub fn table_key(&self) -> String {
        self.id().key()
    }

    /// Whether the object carries a deletion timestamp.
    pub fn marked_for_deletion(&self) -> bool {
        self.meta.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.meta.finalizers.iter().any(|f| f == ROLLOUT_FINALIZER)
    }

    /// Add the finalizer marker. Returns false if it was already present.
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.meta.finalizers.push(ROLLOUT_FINALIZER.to_string());
        true
    }

    /// Remove the finalizer marker. Returns false if it was not present.
    pub fn remove_finalizer(&mut self) -> bool {
        let before = self.meta.finalizers.len();
        self.meta.finalizers.retain(|f| f != ROLLOUT_FINALIZER);
        self.meta.finalizers.len() != before
    }

    /// Maximum step count for this spec, or 0 when the step size is 0.
    pub fn max_step(&self) -> u32 {
        if self.spec.step_capacity == 0 {
            return 0;
        }
        self.spec.total_capacity / self.spec.step_capacity
    }
}

// ── Workload ──────────────────────────────────────────────────────

/// Recorded relationship attributing a workload to the rollout that
/// manages it. Other links from other owners may coexist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerLink {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl OwnerLink {
    pub fn rollout(id: &RolloutId) -> Self {
        Self {
            kind: LINK_KIND_ROLLOUT.to_string(),
            namespace: id.namespace.clone(),
            name: id.name.clone(),
        }
    }

    /// Whether this link points at the given rollout identity.
    pub fn is_rollout(&self, id: &RolloutId) -> bool {
        self.kind == LINK_KIND_ROLLOUT && self.namespace == id.namespace && self.name == id.name
    }
}

/// An externally owned scalable unit referenced by name from a rollout.
/// This system only ever adjusts `capacity` and its own ownership link;
/// it never deletes the workload itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    /// Desired capacity (replica-like count).
    pub capacity: u32,
    /// Label selector matching the pods this workload runs.
    pub selector: BTreeMap<String, String>,
    /// Ownership links; not exclusive to this system.
    pub owner_links: Vec<OwnerLink>,
    /// Optimistic concurrency token, bumped by the store on every write.
    pub resource_version: u64,
}

impl Workload {
    /// Composite key for the workloads table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn has_rollout_link(&self, id: &RolloutId) -> bool {
        self.owner_links.iter().any(|l| l.is_rollout(id))
    }

    /// Add an ownership link for the rollout. Returns false if present.
    pub fn add_rollout_link(&mut self, id: &RolloutId) -> bool {
        if self.has_rollout_link(id) {
            return false;
        }
        self.owner_links.push(OwnerLink::rollout(id));
        true
    }

    /// Remove the rollout's ownership link. Returns false if absent.
    pub fn remove_rollout_link(&mut self, id: &RolloutId) -> bool {
        let before = self.owner_links.len();
        self.owner_links.retain(|l| !l.is_rollout(id));
        self.owner_links.len() != before
    }
}

// ── Pods ──────────────────────────────────────────────────────────

/// Read-only snapshot of one pod selected by a workload. Used only to
/// detect instability of the new workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodObservation {
    pub namespace: String,
    pub name: String,
    /// Pod labels, matched against workload selectors.
    pub labels: BTreeMap<String, String>,
    /// Restart count per container in the pod.
    pub restart_counts: Vec<u32>,
}

impl PodObservation {
    /// Composite key for the pods table.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether any container in this pod has restarted.
    pub fn has_restarts(&self) -> bool {
        self.restart_counts.iter().any(|&c| c > 0)
    }

    /// Whether the pod's labels satisfy the selector (superset match).
    pub fn matches_selector(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

// ── Commands ──────────────────────────────────────────────────────

/// Imperative commands carried in the one-shot command annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start (or restart) the shift: state → Running.
    Apply,
    /// Reset the step counter to 0, then stop.
    Rollback,
    /// Halt the shift: state → Stopped.
    Stop,
    /// Jump to the final step: state → Complete.
    Completion,
}

impl Command {
    /// Parse a command name, case-insensitively. Unknown names yield
    /// `None`; the caller still consumes the marker.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "apply" => Some(Self::Apply),
            "rollback" => Some(Self::Rollback),
            "stop" => Some(Self::Stop),
            "completion" => Some(Self::Completion),
            _ => None,
        }
    }
}

// ── Capacity math ─────────────────────────────────────────────────

/// Split the total capacity for a given step: the new workload gets
/// `step * current` units (capped at the total), the old workload the
/// remainder. Both sides are ≥ 0 by construction.
pub fn capacity_split(total: u32, step: u32, current: u32) -> (u32, u32) {
    let new = (u64::from(step) * u64::from(current)).min(u64::from(total)) as u32;
    (total - new, new)
}
