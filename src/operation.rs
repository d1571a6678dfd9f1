use crate::error::OperationError;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_OPERATION_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Process-unique identity of an `Operation`. All clones of a handle share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
  fn next() -> Self {
    OperationId(NEXT_OPERATION_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
  }

  pub fn as_u64(self) -> u64 {
    self.0
  }
}

impl fmt::Display for OperationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "op-{}", self.0)
  }
}

type Observer<T, E> = Box<dyn FnOnce(&Result<T, E>) + Send + 'static>;

enum OperationState<T, E> {
  Pending {
    observers: Vec<Observer<T, E>>,
    /// One slot per handle currently being awaited, keyed by `Operation::wait_key`.
    wakers: HashMap<u64, Waker>,
    next_wait_key: u64,
  },
  Completed(Arc<Result<T, E>>),
}

struct OperationInner<T, E> {
  id: OperationId,
  state: Mutex<OperationState<T, E>>,
}

/// A single-completion handle for work in progress.
///
/// An operation completes exactly once, with either a success value or a
/// failure. Observers registered with [`Operation::on_complete`] receive the
/// outcome by reference, in registration order, so no observer can alter what
/// another one (or an `.await`er) sees.
///
/// Handles are cheap to clone; every clone refers to the same completion cell.
/// When `T` and `E` are `Clone` the handle can be awaited directly. A handle
/// that stops being awaited releases its waker when dropped.
pub struct Operation<T, E> {
  inner: Arc<OperationInner<T, E>>,
  wait_key: Option<u64>,
}

impl<T, E> Clone for Operation<T, E> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
      wait_key: None,
    }
  }
}

impl<T, E> Drop for Operation<T, E> {
  fn drop(&mut self) {
    if let Some(key) = self.wait_key.take() {
      if let OperationState::Pending { wakers, .. } = &mut *self.inner.state.lock() {
        wakers.remove(&key);
      }
    }
  }
}

impl<T, E> fmt::Debug for Operation<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let (completed, observer_count, awaiting_count) = match &*self.inner.state.lock() {
      OperationState::Pending { observers, wakers, .. } => (false, observers.len(), wakers.len()),
      OperationState::Completed(_) => (true, 0, 0),
    };
    f.debug_struct("Operation")
      .field("id", &self.inner.id)
      .field("completed", &completed)
      .field("observer_count", &observer_count)
      .field("awaiting_count", &awaiting_count)
      .finish()
  }
}

impl<T, E> Operation<T, E>
where
  T: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  /// Creates a pending operation.
  pub fn new() -> Self {
    Self::with_state(OperationState::Pending {
      observers: Vec::new(),
      wakers: HashMap::new(),
      next_wait_key: 0,
    })
  }

  /// Creates an operation that has already completed with `outcome`.
  pub fn completed(outcome: Result<T, E>) -> Self {
    Self::with_state(OperationState::Completed(Arc::new(outcome)))
  }

  pub fn succeeded(value: T) -> Self {
    Self::completed(Ok(value))
  }

  pub fn failed(error: E) -> Self {
    Self::completed(Err(error))
  }

  fn with_state(state: OperationState<T, E>) -> Self {
    Self {
      inner: Arc::new(OperationInner {
        id: OperationId::next(),
        state: Mutex::new(state),
      }),
      wait_key: None,
    }
  }

  pub fn id(&self) -> OperationId {
    self.inner.id
  }

  pub fn is_completed(&self) -> bool {
    matches!(*self.inner.state.lock(), OperationState::Completed(_))
  }

  /// Completes the operation successfully. See [`Operation::complete`].
  pub fn succeed(&self, value: T) -> Result<(), OperationError> {
    self.complete(Ok(value))
  }

  /// Completes the operation with a failure. See [`Operation::complete`].
  pub fn fail(&self, error: E) -> Result<(), OperationError> {
    self.complete(Err(error))
  }

  /// Completes the operation with `outcome`.
  ///
  /// Observers run synchronously on the calling thread, in the order they were
  /// registered, before any `.await`ing task is woken.
  ///
  /// # Errors
  /// Returns `OperationError::AlreadyCompleted` if the operation already has an
  /// outcome. The first outcome is kept and `outcome` is dropped.
  pub fn complete(&self, outcome: Result<T, E>) -> Result<(), OperationError> {
    let outcome = Arc::new(outcome);
    let (observers, wakers) = {
      let mut state = self.inner.state.lock();
      let taken = match &mut *state {
        OperationState::Completed(_) => {
          debug!(operation_id = %self.inner.id, "Operation: Rejected completion of an already completed operation.");
          return Err(OperationError::AlreadyCompleted(self.inner.id));
        }
        OperationState::Pending { observers, wakers, .. } => (std::mem::take(observers), std::mem::take(wakers)),
      };
      *state = OperationState::Completed(outcome.clone());
      taken
    };

    trace!(
      operation_id = %self.inner.id,
      succeeded = outcome.is_ok(),
      observers = observers.len(),
      "Operation completed. Running observers."
    );
    for observer in observers {
      Self::run_observer(self.inner.id, observer, &outcome);
    }
    for waker in wakers.into_values() {
      waker.wake();
    }
    Ok(())
  }

  /// Registers `observer` to run once the operation completes.
  ///
  /// If the operation has already completed, `observer` runs immediately on
  /// the calling thread. A panicking observer is logged and does not stop the
  /// observers after it.
  pub fn on_complete<F>(&self, observer: F)
  where
    F: FnOnce(&Result<T, E>) + Send + 'static,
  {
    let outcome = {
      let mut state = self.inner.state.lock();
      match &mut *state {
        OperationState::Pending { observers, .. } => {
          observers.push(Box::new(observer));
          return;
        }
        OperationState::Completed(outcome) => outcome.clone(),
      }
    };
    Self::run_observer(self.inner.id, observer, &outcome);
  }

  fn run_observer(id: OperationId, observer: impl FnOnce(&Result<T, E>), outcome: &Result<T, E>) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| observer(outcome)));
    if result.is_err() {
      error!(operation_id = %id, "An operation observer panicked during execution.");
    }
  }

  /// Returns a copy of the outcome, or `None` while the operation is pending.
  pub fn outcome(&self) -> Option<Result<T, E>>
  where
    T: Clone,
    E: Clone,
  {
    match &*self.inner.state.lock() {
      OperationState::Pending { .. } => None,
      OperationState::Completed(outcome) => Some((**outcome).clone()),
    }
  }

  /// Derives a new operation whose outcome is `f` applied to this one's.
  ///
  /// This operation's outcome is left untouched for every other observer.
  pub fn then<U, E2, F>(&self, f: F) -> Operation<U, E2>
  where
    U: Send + Sync + 'static,
    E2: Send + Sync + 'static,
    F: FnOnce(&Result<T, E>) -> Result<U, E2> + Send + 'static,
  {
    let derived = Operation::new();
    let target = derived.clone();
    let source_id = self.inner.id;
    self.on_complete(move |outcome| {
      if target.complete(f(outcome)).is_err() {
        trace!(operation_id = %source_id, derived_id = %target.id(), "Derived operation was completed elsewhere first.");
      }
    });
    derived
  }

  pub fn map<U, F>(&self, f: F) -> Operation<U, E>
  where
    U: Send + Sync + 'static,
    E: Clone,
    F: FnOnce(&T) -> U + Send + 'static,
  {
    self.then(move |outcome| match outcome {
      Ok(value) => Ok(f(value)),
      Err(error) => Err(error.clone()),
    })
  }

  pub fn map_err<E2, F>(&self, f: F) -> Operation<T, E2>
  where
    E2: Send + Sync + 'static,
    T: Clone,
    F: FnOnce(&E) -> E2 + Send + 'static,
  {
    self.then(move |outcome| match outcome {
      Ok(value) => Ok(value.clone()),
      Err(error) => Err(f(error)),
    })
  }

  /// Derives an operation that turns a failure into a success value via `f`.
  pub fn recover<F>(&self, f: F) -> Operation<T, E>
  where
    T: Clone,
    F: FnOnce(&E) -> T + Send + 'static,
  {
    self.then(move |outcome| match outcome {
      Ok(value) => Ok(value.clone()),
      Err(error) => Ok(f(error)),
    })
  }

  /// Runs `future` on `tokio_handle` and completes the returned operation with
  /// its output. A panic inside `future` fails the operation with
  /// `OperationError::Panicked`.
  pub fn spawn<F>(tokio_handle: &TokioHandle, future: F) -> Self
  where
    F: Future<Output = Result<T, E>> + Send + 'static,
    E: From<OperationError>,
  {
    Self::spawn_internal(tokio_handle, future, None)
  }

  /// Like [`Operation::spawn`], but fails the operation with
  /// `OperationError::Cancelled` if `token` is cancelled first.
  pub fn spawn_with_cancellation<F>(tokio_handle: &TokioHandle, future: F, token: CancellationToken) -> Self
  where
    F: Future<Output = Result<T, E>> + Send + 'static,
    E: From<OperationError>,
  {
    Self::spawn_internal(tokio_handle, future, Some(token))
  }

  fn spawn_internal<F>(tokio_handle: &TokioHandle, future: F, token: Option<CancellationToken>) -> Self
  where
    F: Future<Output = Result<T, E>> + Send + 'static,
    E: From<OperationError>,
  {
    let operation = Self::new();
    let operation_id = operation.id();
    let completer = operation.clone();
    let token = token.unwrap_or_else(CancellationToken::new);

    tokio_handle.spawn(
      async move {
        let outcome: Result<T, E> = tokio::select! {
          biased;
          _ = token.cancelled() => {
            debug!(%operation_id, "Spawned operation cancelled by its token.");
            Err(E::from(OperationError::Cancelled(operation_id)))
          },
          future_result = AssertUnwindSafe(future).catch_unwind() => {
            match future_result {
              Ok(outcome) => outcome,
              Err(_panic_payload) => {
                error!(%operation_id, "Spawned operation panicked during execution.");
                Err(E::from(OperationError::Panicked(operation_id)))
              }
            }
          }
        };

        if completer.complete(outcome).is_err() {
          warn!(%operation_id, "Spawned operation was completed elsewhere; its own outcome was dropped.");
        }
      }
      .instrument(info_span!("spawned_operation", %operation_id)),
    );

    operation
  }
}

impl<T, E> Default for Operation<T, E>
where
  T: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone, E: Clone> Future for Operation<T, E> {
  type Output = Result<T, E>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    let mut state = this.inner.state.lock();
    match &mut *state {
      OperationState::Completed(outcome) => Poll::Ready((**outcome).clone()),
      OperationState::Pending {
        wakers, next_wait_key, ..
      } => {
        let key = *this.wait_key.get_or_insert_with(|| {
          let key = *next_wait_key;
          *next_wait_key += 1;
          key
        });
        match wakers.get_mut(&key) {
          Some(waker) if waker.will_wake(cx.waker()) => {}
          Some(waker) => *waker = cx.waker().clone(),
          None => {
            wakers.insert(key, cx.waker().clone());
          }
        }
        Poll::Pending
      }
    }
  }
}
