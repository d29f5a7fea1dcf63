//! ShiftGrid convergence engine — the rollout reconciliation state machine.
//!
//! Given one rollout intent and its two workloads, a reconcile pass
//! computes the desired capacity split, applies ownership edits, detects
//! crash signals on the new workload, and decides whether the step timer
//! should be armed or disarmed. Every pass is safe to re-run from
//! scratch; write conflicts are transient and resolved by the next
//! trigger.
//!
//! # Components
//!
//! - **`engine`** — the per-trigger reconcile pipeline
//! - **`sync`** — capacity targets and ownership links
//! - **`detect`** — crash detection and automatic rollback
//! - **`command`** — the one-shot imperative command vocabulary

pub mod command;
pub mod detect;
pub mod engine;
pub mod error;
pub mod sync;

pub use engine::{ConvergenceEngine, Outcome};
pub use error::{EngineError, EngineResult};
