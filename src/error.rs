use crate::operation::OperationId;

use std::sync::Arc;
use thiserror::Error;

/// Errors raised by an `OperationPool` when it is misused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Operation {operation_id} is already underway in pool '{pool_name}'")]
  AlreadyUnderway {
    pool_name: Arc<String>,
    operation_id: OperationId,
  },
}

/// Errors produced by `Operation` itself, independent of any pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationError {
  #[error("Operation {0} was already completed")]
  AlreadyCompleted(OperationId),

  #[error("Spawned future for operation {0} panicked")]
  Panicked(OperationId),

  #[error("Spawned future for operation {0} was cancelled")]
  Cancelled(OperationId),
}
