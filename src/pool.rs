use crate::error::PoolError;
use crate::notifier::{DrainEvent, DrainNotifier};
use crate::operation::{Operation, OperationId};

use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use indexmap::map::Entry;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

/// Handle returned by [`OperationPool::notify_when_empty`]. Completes with
/// `Ok(())` when the pool drains and can never fail.
pub type DrainSignal = Operation<(), Infallible>;

/// How [`OperationPool::notify_when_empty`] treats a pool that is already empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainCheck {
  /// An empty pool yields an already-completed signal that is not registered.
  #[default]
  Immediate,
  /// Always register a waiter, which fires on the next drain transition only.
  /// On an empty pool that means the pool must first gain and then lose an
  /// operation.
  NextDrain,
}

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PoolStatus {
  pub underway: usize,
  pub waiting: usize,
}

impl PartialEq<(usize, usize)> for PoolStatus {
  fn eq(&self, other: &(usize, usize)) -> bool {
    (self.underway, self.waiting) == *other
  }
}

impl From<PoolStatus> for (usize, usize) {
  fn from(status: PoolStatus) -> Self {
    (status.underway, status.waiting)
  }
}

impl fmt::Display for PoolStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} underway, {} waiting", self.underway, self.waiting)
  }
}

#[derive(Default)]
struct PoolState {
  /// Underway ids mapped to their add sequence number. Removal swaps, so the
  /// sequence number, not the map position, carries insertion order.
  underway: IndexMap<OperationId, u64>,
  next_seq: u64,
  waiters: Vec<DrainSignal>,
}

struct PoolInner {
  pool_name: Arc<String>,
  state: Mutex<PoolState>,
  notifier: DrainNotifier,
}

/// Tracks in-flight operations and tells waiters when none are left.
///
/// The pool only observes: it never runs, cancels or completes the operations
/// it tracks. Clones share the same underway set and waiter list.
#[derive(Clone)]
pub struct OperationPool {
  inner: Arc<PoolInner>,
}

impl fmt::Debug for OperationPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OperationPool")
      .field("pool_name", &self.inner.pool_name)
      .field("status", &self.status())
      .field("notifier", &self.inner.notifier)
      .finish()
  }
}

impl Default for OperationPool {
  fn default() -> Self {
    Self::new("default")
  }
}

impl OperationPool {
  /// Creates an empty pool. `pool_name` only labels logs, errors and drain events.
  pub fn new(pool_name: &str) -> Self {
    let pool_name = Arc::new(pool_name.to_string());
    debug!(pool_name = %*pool_name, "Operation pool created.");
    Self {
      inner: Arc::new(PoolInner {
        notifier: DrainNotifier::new(pool_name.clone()),
        pool_name,
        state: Mutex::new(PoolState::default()),
      }),
    }
  }

  /// Returns the name this pool was created with.
  pub fn name(&self) -> &str {
    &self.inner.pool_name
  }

  /// Registers `operation` as underway.
  ///
  /// When the operation completes, successfully or not, it is removed from the
  /// underway set; if that leaves the set empty every pending waiter fires. The
  /// pool's observer only reads the outcome, so callers see exactly what the
  /// operation resolved with no matter when they attached their own observers.
  ///
  /// An operation that has already completed is added and removed at once.
  ///
  /// # Errors
  /// Returns `PoolError::AlreadyUnderway` if `operation` is still underway in
  /// this pool. Counts are left unchanged.
  pub fn add<T, E>(&self, operation: &Operation<T, E>) -> Result<(), PoolError>
  where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
  {
    let operation_id = operation.id();
    {
      let mut state = self.inner.state.lock();
      let seq = state.next_seq;
      match state.underway.entry(operation_id) {
        Entry::Occupied(_) => {
          warn!(pool_name = %*self.inner.pool_name, %operation_id, "Add: Operation is already underway; rejecting duplicate registration.");
          return Err(PoolError::AlreadyUnderway {
            pool_name: self.inner.pool_name.clone(),
            operation_id,
          });
        }
        Entry::Vacant(slot) => {
          slot.insert(seq);
        }
      }
      state.next_seq += 1;
      debug!(
        pool_name = %*self.inner.pool_name,
        %operation_id,
        underway = state.underway.len(),
        "Operation added to pool."
      );
    }

    // The id must be in the underway set before this runs: for a completed
    // operation it fires right here.
    let pool = Arc::downgrade(&self.inner);
    operation.on_complete(move |_outcome| PoolInner::operation_finished(&pool, operation_id));
    Ok(())
  }

  /// Returns a point-in-time snapshot of the underway and waiting counts.
  ///
  /// Completion bookkeeping runs inside the completing call, so a status read
  /// after `complete` returns already reflects the removal.
  pub fn status(&self) -> PoolStatus {
    let state = self.inner.state.lock();
    PoolStatus {
      underway: state.underway.len(),
      waiting: state.waiters.len(),
    }
  }

  /// Returns `true` if no operation is underway. Pending waiters are not counted.
  pub fn is_empty(&self) -> bool {
    self.inner.state.lock().underway.is_empty()
  }

  /// Ids of the underway operations, in the order they were added.
  pub fn underway_ids(&self) -> Vec<OperationId> {
    let mut underway: Vec<(u64, OperationId)> = {
      let state = self.inner.state.lock();
      state.underway.iter().map(|(id, seq)| (*seq, *id)).collect()
    };
    underway.sort_unstable();
    underway.into_iter().map(|(_, id)| id).collect()
  }

  /// Returns a signal that completes when the pool drains.
  ///
  /// See [`DrainCheck`] for how an already-empty pool is treated.
  pub fn notify_when_empty(&self, check: DrainCheck) -> DrainSignal {
    let mut state = self.inner.state.lock();
    if state.underway.is_empty() && check == DrainCheck::Immediate {
      trace!(pool_name = %*self.inner.pool_name, "Pool already empty; returning completed drain signal.");
      return DrainSignal::succeeded(());
    }

    let signal = DrainSignal::new();
    state.waiters.push(signal.clone());
    trace!(
      pool_name = %*self.inner.pool_name,
      waiter_id = %signal.id(),
      ?check,
      waiting = state.waiters.len(),
      "Registered drain waiter."
    );
    signal
  }

  /// Waits until the pool is empty, returning at once if it already is.
  pub async fn wait_for_drain(&self) {
    match self.notify_when_empty(DrainCheck::Immediate).await {
      Ok(()) => {}
      Err(never) => match never {},
    }
  }

  /// Registers `handler` to run after the waiters on every drain of this pool.
  pub fn add_drain_handler(&self, handler: impl Fn(DrainEvent) + Send + Sync + 'static) {
    self.inner.notifier.add_handler(handler);
  }

  /// Returns the number of registered drain handlers.
  pub fn drain_handler_count(&self) -> usize {
    self.inner.notifier.handler_count()
  }
}

impl PoolInner {
  fn operation_finished(pool: &Weak<PoolInner>, operation_id: OperationId) {
    match pool.upgrade() {
      Some(inner) => inner.remove_underway(operation_id),
      None => trace!(%operation_id, "Operation completed after its pool was dropped."),
    }
  }

  fn remove_underway(&self, operation_id: OperationId) {
    let released = {
      let mut state = self.state.lock();
      if state.underway.swap_remove(&operation_id).is_none() {
        trace!(pool_name = %*self.pool_name, %operation_id, "Completed operation was not underway.");
        return;
      }
      debug!(
        pool_name = %*self.pool_name,
        %operation_id,
        underway = state.underway.len(),
        "Operation completed; removed from underway set."
      );
      if !state.underway.is_empty() {
        return;
      }
      std::mem::take(&mut state.waiters)
    };

    self.drain(released);
  }

  fn drain(&self, released: Vec<DrainSignal>) {
    let waiters_released = released.len();
    debug!(pool_name = %*self.pool_name, waiters_released, "Pool drained. Releasing waiters.");

    for waiter in released {
      if waiter.succeed(()).is_err() {
        warn!(pool_name = %*self.pool_name, waiter_id = %waiter.id(), "Drain waiter was already completed elsewhere.");
      }
    }

    self.notifier.notify(DrainEvent {
      pool_name: self.pool_name.clone(),
      waiters_released,
      drained_at: SystemTime::now(),
    });
  }
}

impl Drop for PoolInner {
  fn drop(&mut self) {
    let state = self.state.get_mut();
    if state.underway.is_empty() && state.waiters.is_empty() {
      trace!(pool_name = %*self.pool_name, "Drop: Pool dropped while idle.");
    } else {
      debug!(
        pool_name = %*self.pool_name,
        underway = state.underway.len(),
        waiting = state.waiters.len(),
        "Drop: Pool dropped with operations underway. Pending drain waiters will never fire."
      );
    }
  }
}
