use tokio::runtime::Handle;

use crate::{error::FlowError, scheduler::Scheduler, scheduler::Task};

/// Runs tasks on the blocking pool of a tokio runtime.
///
/// Consumer callbacks are synchronous and may block, so they are kept off
/// the async worker threads.
#[derive(Clone, Debug)]
pub struct TokioScheduler {
  handle: Handle,
}

impl TokioScheduler {
  pub fn new(handle: Handle) -> Self { Self { handle } }

  /// Uses the runtime of the calling context.
  ///
  /// Panics when called outside of a tokio runtime.
  pub fn current() -> Self { Self::new(Handle::current()) }
}

impl Scheduler for TokioScheduler {
  fn submit(&self, task: Task) -> Result<(), FlowError> {
    drop(self.handle.spawn_blocking(task));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use futures::channel::oneshot;

  use super::*;

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn runs_task_on_runtime() {
    let scheduler = TokioScheduler::current();
    let (tx, rx) = oneshot::channel();
    scheduler
      .submit(Box::new(move || {
        let _ = tx.send(42);
      }))
      .unwrap();
    let value = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(value, 42);
  }
}
