use operation_pool::{DrainCheck, DrainEvent, Operation, OperationError, OperationPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, thiserror::Error)]
enum JobError {
  #[error(transparent)]
  Operation(#[from] OperationError),
  #[error("job {0} failed")]
  Failed(usize),
}

// Dummy job function
async fn my_job(id: usize, delay_ms: u64, should_fail: bool) -> Result<String, JobError> {
  info!("Job {}: Starting, will sleep for {}ms. Fail: {}", id, delay_ms, should_fail);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  if should_fail {
    return Err(JobError::Failed(id));
  }
  Ok(format!("Job {} finished after {}ms", id, delay_ms))
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Drain Notification Example ---");

  let pool = OperationPool::new("drain_example_pool");
  let drains = Arc::new(AtomicUsize::new(0));
  let drains_clone = drains.clone();
  pool.add_drain_handler(move |event: DrainEvent| {
    drains_clone.fetch_add(1, Ordering::Relaxed);
    info!(
      "[Drain Handler] Pool {} drained, released {} waiters at {:?}",
      event.pool_name, event.waiters_released, event.drained_at
    );
  });

  let handle = Handle::current();
  let cancel_token = CancellationToken::new();
  let jobs = vec![
    Operation::spawn(&handle, my_job(1, 300, false)),
    Operation::spawn(&handle, my_job(2, 100, true)),
    Operation::spawn_with_cancellation(&handle, my_job(3, 2000, false), cancel_token.clone()),
  ];
  for job in &jobs {
    let job_id = job.id();
    job.on_complete(move |outcome| match outcome {
      Ok(result) => info!("Main: {} -> {}", job_id, result),
      Err(e) => info!("Main: {} -> error: {}", job_id, e),
    });
    if let Err(e) = pool.add(job) {
      info!("Main: could not track {}: {}", job_id, e);
    }
  }

  let drained = pool.notify_when_empty(DrainCheck::Immediate);
  info!("Jobs tracked. Status: {}", pool.status());

  tokio::time::sleep(Duration::from_millis(150)).await;
  info!("Cancelling job 3. Status: {}", pool.status());
  cancel_token.cancel();

  if drained.await.is_ok() {
    info!("Pool drained. Status: {}", pool.status());
  }

  info!("Drain events observed by handler: {}", drains.load(Ordering::Relaxed));
  info!("--- Drain Notification Example End ---");
}
