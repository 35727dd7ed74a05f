//! Worker pools executing flush and delivery work.
//!
//! Every consumer callback of the crate runs inside a task handed to a
//! [`Scheduler`]. The thread calling `publish`, `request` or `cancel` only
//! records state changes and submits tasks.

use std::sync::Arc;

use crate::error::FlowError;

mod manual_scheduler;
#[cfg(feature = "futures-scheduler")]
mod thread_pool_scheduler;
#[cfg(feature = "tokio-scheduler")]
mod tokio_scheduler;
mod worker_pool;

pub use manual_scheduler::ManualScheduler;
#[cfg(feature = "futures-scheduler")]
pub use thread_pool_scheduler::new_thread_pool;
#[cfg(feature = "tokio-scheduler")]
pub use tokio_scheduler::TokioScheduler;
pub use worker_pool::WorkerPool;

/// A unit of work submitted to a [`Scheduler`].
///
/// A scheduler may drop a task without running it, when it rejects the task
/// or shuts down. Tasks that must clean up in that case do it on drop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A bounded pool of threads that executes submitted tasks.
///
/// Implementations must never run the task on the submitting thread: callers
/// submit while holding per-consumer resources that the task acquires.
pub trait Scheduler: Send + Sync {
  fn submit(&self, task: Task) -> Result<(), FlowError>;
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
  #[inline]
  fn submit(&self, task: Task) -> Result<(), FlowError> { (**self).submit(task) }
}

pub type SharedScheduler = Arc<dyn Scheduler>;
