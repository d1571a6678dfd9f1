//! Drain tracking for in-flight asynchronous operations.
//!
//! An [`OperationPool`] observes a changing set of [`Operation`]s and resolves
//! every pending [`DrainSignal`] once the last of them completes. The pool never
//! runs, cancels or alters the operations it tracks.

mod error;
mod notifier;
mod operation;
mod pool;

pub use error::{OperationError, PoolError};
pub use notifier::DrainEvent;
pub use operation::{Operation, OperationId};
pub use pool::{DrainCheck, DrainSignal, OperationPool, PoolStatus};
