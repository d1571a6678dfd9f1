use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::{debug, error, info, trace};

/// Delivered to every drain handler each time a pool's underway set empties.
#[derive(Debug, Clone)]
pub struct DrainEvent {
  pub pool_name: Arc<String>,
  /// Number of fire-once waiters resolved by this drain.
  pub waiters_released: usize,
  pub drained_at: SystemTime,
}

type DrainHandler = Arc<dyn Fn(DrainEvent) + Send + Sync + 'static>;

/// Persistent drain handlers of a single pool.
///
/// Unlike drain waiters, handlers are never removed: each one runs on every
/// drain for the lifetime of the pool.
pub(crate) struct DrainNotifier {
  pool_name: Arc<String>,
  handlers: RwLock<Vec<DrainHandler>>,
}

impl fmt::Debug for DrainNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |guard| guard.len());
    f.debug_struct("DrainNotifier")
      .field("pool_name", &self.pool_name)
      .field("handler_count", &handler_count)
      .finish()
  }
}

impl DrainNotifier {
  pub(crate) fn new(pool_name: Arc<String>) -> Self {
    Self {
      pool_name,
      handlers: RwLock::new(Vec::new()),
    }
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(DrainEvent) + Send + Sync + 'static) {
    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(Arc::new(handler));
    info!(pool_name = %*self.pool_name, "Notifier: Added new drain handler. Total handlers: {}", handlers_guard.len());
  }

  pub(crate) fn handler_count(&self) -> usize {
    self.handlers.read().len()
  }

  pub(crate) fn notify(&self, event: DrainEvent) {
    // Snapshot so a handler may register further handlers without deadlocking.
    let handlers: Vec<DrainHandler> = self.handlers.read().clone();
    if handlers.is_empty() {
      trace!(pool_name = %*self.pool_name, "No drain handlers registered, dropping drain event.");
      return;
    }

    debug!(
      pool_name = %*self.pool_name,
      waiters_released = event.waiters_released,
      "Dispatching drain event to {} handlers.",
      handlers.len()
    );

    for handler in handlers {
      let event_for_handler = event.clone();
      let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event_for_handler)));
      if result.is_err() {
        error!(pool_name = %*self.pool_name, "A drain handler panicked during execution.");
      }
    }
  }
}
