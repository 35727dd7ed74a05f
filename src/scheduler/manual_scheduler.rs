use std::{
  collections::VecDeque,
  sync::{Arc, Mutex},
};

use crate::{
  error::FlowError,
  rc::RcDerefMut,
  scheduler::{Scheduler, SharedScheduler, Task},
};

/// A scheduler that only queues tasks. They run when the owner calls
/// [`ManualScheduler::run_tasks`], which makes delivery fully deterministic.
#[derive(Clone, Default)]
pub struct ManualScheduler {
  tasks: Arc<Mutex<VecDeque<Task>>>,
}

impl ManualScheduler {
  pub fn new() -> Self { Self::default() }

  /// This scheduler as a shared trait object. Clones share one queue.
  pub fn shared(&self) -> SharedScheduler { Arc::new(self.clone()) }

  /// Number of queued tasks.
  pub fn pending(&self) -> usize { self.tasks.rc_deref_mut().len() }

  /// Runs the oldest queued task, returns `false` when the queue was empty.
  pub fn run_next(&self) -> bool {
    let task = self.tasks.rc_deref_mut().pop_front();
    match task {
      Some(task) => {
        task();
        true
      }
      None => false,
    }
  }

  /// Runs queued tasks, including the ones they submit, until the queue is
  /// empty. Returns how many tasks ran.
  pub fn run_tasks(&self) -> usize {
    let mut count = 0;
    while self.run_next() {
      count += 1;
    }
    count
  }
}

impl Scheduler for ManualScheduler {
  fn submit(&self, task: Task) -> Result<(), FlowError> {
    self.tasks.rc_deref_mut().push_back(task);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  #[test]
  fn tasks_wait_for_run() {
    let scheduler = ManualScheduler::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let c_hits = hits.clone();
    scheduler
      .submit(Box::new(move || {
        c_hits.fetch_add(1, Ordering::SeqCst);
      }))
      .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.pending(), 1);
    assert_eq!(scheduler.run_tasks(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn nested_submissions_run_in_order() {
    let scheduler = ManualScheduler::new();
    let order = Arc::new(Mutex::new(vec![]));
    let (c_scheduler, c_order) = (scheduler.clone(), order.clone());
    scheduler
      .submit(Box::new(move || {
        c_order.lock().unwrap().push(1);
        let c_order = c_order.clone();
        c_scheduler.submit(Box::new(move || c_order.lock().unwrap().push(3))).unwrap();
      }))
      .unwrap();
    let c_order = order.clone();
    scheduler.submit(Box::new(move || c_order.lock().unwrap().push(2))).unwrap();
    assert_eq!(scheduler.run_tasks(), 3);
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
  }
}
