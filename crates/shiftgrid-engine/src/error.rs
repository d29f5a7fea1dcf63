//! Convergence engine error types.

use thiserror::Error;

use shiftgrid_state::GatewayError;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors a reconcile pass can surface to the driver.
///
/// Version conflicts never appear here; they are absorbed into a
/// requeue outcome. What remains is retryable I/O.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}
