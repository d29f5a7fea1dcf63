//! ShiftGrid state — domain types, embedded state store, and workload gateway.
//!
//! This crate holds the persisted shape of a progressive capacity shift:
//! the `Rollout` intent object, the two `Workload` objects it manages, and
//! the pod observations used for crash detection. All records are
//! JSON-serialized into redb's `&[u8]` value columns, with optimistic
//! versioning so that concurrent writers (the convergence engine and the
//! step scheduler) can detect stale writes.
//!
//! # Components
//!
//! - **`types`** — Rollout, Workload, ownership links, command vocabulary
//! - **`store`** — redb-backed `StateStore` with compare-and-swap updates
//! - **`gateway`** — the `WorkloadGateway` trait consumed by the engine
//!   and scheduler, plus `StoreGateway` backed by the local store

pub mod error;
pub mod gateway;
pub mod store;
mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use gateway::{GatewayError, GatewayResult, SharedGateway, StoreGateway, WorkloadGateway};
pub use store::StateStore;
pub use types::*;
