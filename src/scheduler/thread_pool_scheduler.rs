use futures::{executor::ThreadPool, future};

use crate::{config::ServiceConfig, error::FlowError, scheduler::Scheduler, scheduler::Task};

impl Scheduler for ThreadPool {
  fn submit(&self, task: Task) -> Result<(), FlowError> {
    self.spawn_ok(future::lazy(move |_| task()));
    Ok(())
  }
}

/// Builds the `futures` thread pool described by `config`.
pub fn new_thread_pool(config: &ServiceConfig) -> Result<ThreadPool, FlowError> {
  let mut builder = ThreadPool::builder();
  builder.name_prefix(config.thread_name_prefix.clone());
  if config.worker_threads > 0 {
    builder.pool_size(config.worker_threads);
  }
  builder.create().map_err(|err| FlowError::WorkerPool { message: err.to_string() })
}
