use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex,
  },
  time::Duration,
};

use tracing::{debug, warn};

use crate::{
  error::FlowError,
  rc::RcDerefMut,
  scheduler::{Scheduler, SharedScheduler, Task},
};

/// Wraps a [`Scheduler`] with in-flight accounting so that it can be shut
/// down with a bounded wait.
///
/// After [`WorkerPool::shutdown`] the pool rejects new tasks. If the grace
/// period elapses first, queued tasks that have not started yet are skipped
/// when the underlying scheduler gets to them. Skipped and rejected tasks are
/// dropped without running, which is how their owners learn about it.
#[derive(Clone)]
pub struct WorkerPool {
  scheduler: SharedScheduler,
  state: Arc<PoolState>,
}

struct PoolState {
  accepting: AtomicBool,
  aborted: AtomicBool,
  in_flight: Mutex<usize>,
  idle: Condvar,
}

struct InFlight(Arc<PoolState>);

impl InFlight {
  fn enter(state: &Arc<PoolState>) -> Self {
    *state.in_flight.rc_deref_mut() += 1;
    InFlight(state.clone())
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    let mut count = self.0.in_flight.rc_deref_mut();
    *count = count.saturating_sub(1);
    if *count == 0 {
      self.0.idle.notify_all();
    }
  }
}

impl WorkerPool {
  pub fn new(scheduler: SharedScheduler) -> Self {
    Self {
      scheduler,
      state: Arc::new(PoolState {
        accepting: AtomicBool::new(true),
        aborted: AtomicBool::new(false),
        in_flight: Mutex::new(0),
        idle: Condvar::new(),
      }),
    }
  }

  /// Submitted tasks that have not finished (or been skipped) yet.
  pub fn in_flight(&self) -> usize { *self.state.in_flight.rc_deref_mut() }

  pub fn is_accepting(&self) -> bool { self.state.accepting.load(Ordering::Acquire) }

  /// Waits up to `grace` for in-flight tasks to drain, then stops accepting
  /// work.
  ///
  /// Must not be called from a task running on this pool: that task counts
  /// as in flight and the wait could only end by timing out.
  pub fn shutdown(&self, grace: Duration) -> Result<(), FlowError> {
    let count = self.state.in_flight.rc_deref_mut();
    let (count, timeout) = match self.state.idle.wait_timeout_while(count, grace, |n| *n > 0) {
      Ok(res) => res,
      Err(poisoned) => poisoned.into_inner(),
    };
    let in_flight = *count;
    drop(count);

    self.state.accepting.store(false, Ordering::Release);
    if timeout.timed_out() && in_flight > 0 {
      self.state.aborted.store(true, Ordering::Release);
      warn!(in_flight, ?grace, "worker pool shutdown grace exceeded, skipping queued tasks");
      return Err(FlowError::ShutdownTimeout { grace, in_flight });
    }
    debug!("worker pool drained");
    Ok(())
  }
}

impl Scheduler for WorkerPool {
  fn submit(&self, task: Task) -> Result<(), FlowError> {
    if !self.is_accepting() {
      return Err(FlowError::Rejected);
    }
    let guard = InFlight::enter(&self.state);
    let state = self.state.clone();
    self.scheduler.submit(Box::new(move || {
      let _guard = guard;
      if state.aborted.load(Ordering::Acquire) {
        drop(task);
      } else {
        task();
      }
    }))
  }
}
