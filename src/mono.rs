//! Single-value publisher used for request/reply.
//!
//! A [`MonoPublisher`] is finalized at most once, with either a value or an
//! error. Each subscription receives the outcome as soon as it requested at
//! least one item and the outcome is known: `on_next` followed by
//! `on_complete`, or a single `on_error`. Subscribing after finalization
//! replays the outcome.
//!
//! # Example
//!
//! ```rust
//! use futures::executor::block_on;
//! use rxflow::prelude::*;
//!
//! let scheduler = ManualScheduler::new();
//! let reply = MonoPublisher::<String>::new(scheduler.shared());
//! let answer = reply.clone().into_future();
//!
//! reply.set_data("pong".to_owned()).unwrap();
//! scheduler.run_tasks();
//! assert_eq!(block_on(answer), Ok("pong".to_owned()));
//! ```

use std::{
  future::Future,
  panic::{catch_unwind, AssertUnwindSafe},
  pin::Pin,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, TryLockError, Weak,
  },
  task::{Context, Poll},
};

use futures::channel::oneshot;
use pin_project_lite::pin_project;
use tracing::{debug, error, warn};

use crate::{
  error::FlowError,
  rc::RcDerefMut,
  scheduler::{SharedScheduler, Task},
  subscriber::{BoxedSubscriber, Subscriber, Subscription, SubscriptionHandle},
  subscription::SubscriptionId,
};

struct MonoState<T> {
  result: Option<Result<T, FlowError>>,
  pending: Vec<Arc<MonoSubscription<T>>>,
}

struct MonoCore<T> {
  scheduler: SharedScheduler,
  state: Mutex<MonoState<T>>,
  // Only one flush cycle runs at a time.
  flushing: AtomicBool,
  this: Weak<MonoCore<T>>,
}

/// Flush work handed to the scheduler. Dropped without running, it releases
/// every pending subscription.
struct MonoFlush<T: Clone + Send + 'static>(Option<Arc<MonoCore<T>>>);

impl<T: Clone + Send + 'static> MonoFlush<T> {
  fn run(mut self) {
    if let Some(core) = self.0.take() {
      core.flush_cycle();
    }
  }
}

impl<T: Clone + Send + 'static> Drop for MonoFlush<T> {
  fn drop(&mut self) {
    if let Some(core) = self.0.take() {
      core.abandon_flush();
    }
  }
}

/// Publisher of at most one value or error.
pub struct MonoPublisher<T> {
  core: Arc<MonoCore<T>>,
}

impl<T> Clone for MonoPublisher<T> {
  fn clone(&self) -> Self { Self { core: self.core.clone() } }
}

impl<T: Clone + Send + 'static> MonoPublisher<T> {
  pub fn new(scheduler: SharedScheduler) -> Self {
    Self {
      core: Arc::new_cyclic(|this| MonoCore {
        scheduler,
        state: Mutex::new(MonoState { result: None, pending: vec![] }),
        flushing: AtomicBool::new(false),
        this: this.clone(),
      }),
    }
  }

  /// Finalizes with `value`.
  pub fn set_data(&self, value: T) -> Result<(), FlowError> { self.finalize(Ok(value)) }

  /// Finalizes with `err`.
  pub fn set_exception(&self, err: FlowError) -> Result<(), FlowError> { self.finalize(Err(err)) }

  fn finalize(&self, result: Result<T, FlowError>) -> Result<(), FlowError> {
    {
      let mut state = self.core.state.rc_deref_mut();
      if state.result.is_some() {
        error!(succeeded = result.is_ok(), "mono publisher finalized twice");
        return Err(FlowError::AlreadyFinalized);
      }
      state.result = Some(result);
    }
    self.core.schedule_flush();
    Ok(())
  }

  pub fn is_finalized(&self) -> bool { self.core.state.rc_deref_mut().result.is_some() }

  /// Subscriptions that did not receive their outcome yet.
  pub fn pending_subscriptions(&self) -> usize { self.core.state.rc_deref_mut().pending.len() }

  pub fn subscribe<S>(&self, subscriber: S) -> Arc<MonoSubscription<T>>
  where
    S: Subscriber<T> + 'static,
  {
    let subscription = Arc::new(MonoSubscription {
      id: SubscriptionId::next(),
      flags: Mutex::new(Flags::default()),
      consumer: Mutex::new(Some(Box::new(subscriber) as BoxedSubscriber<T>)),
      owner: Arc::downgrade(&self.core),
    });

    // A flush cycle waits on the consumer slot until `on_subscribe` returned.
    let mut slot = subscription.consumer.rc_deref_mut();
    self.core.state.rc_deref_mut().pending.push(subscription.clone());
    if let Some(consumer) = slot.as_mut() {
      let handle: SubscriptionHandle = subscription.clone();
      if let Err(panic) = catch_unwind(AssertUnwindSafe(|| consumer.on_subscribe(handle))) {
        error!(
          subscription = %subscription.id,
          message = %FlowError::from_panic(panic.as_ref()),
          "consumer panicked in on_subscribe, cancelling"
        );
        subscription.flags.rc_deref_mut().cancel();
      }
    }
    if subscription.flags.rc_deref_mut().cancelled {
      slot.take();
    }
    drop(slot);

    debug!(subscription = %subscription.id, "mono subscription created");
    self.core.schedule_flush();
    subscription
  }

  /// Resolves with the outcome once the publisher is finalized, or with
  /// [`FlowError::Dropped`] if it is dropped unfinalized.
  pub fn into_future(self) -> MonoFuture<T> {
    let (tx, rx) = oneshot::channel();
    self.subscribe(FutureSubscriber { tx: Some(tx) });
    MonoFuture { rx }
  }
}

impl<T: Clone + Send + 'static> MonoCore<T> {
  fn schedule_flush(&self) {
    if self
      .flushing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return;
    }
    let Some(this) = self.this.upgrade() else {
      self.flushing.store(false, Ordering::Release);
      return;
    };
    let task = MonoFlush(Some(this));
    let task: Task = Box::new(move || task.run());
    // A rejected task was dropped inside `submit` and already released them.
    if let Err(err) = self.scheduler.submit(task) {
      debug!(error = %err, "mono flush task rejected");
    }
  }

  /// Releases every pending subscription once the flush task holding the
  /// `flushing` token was dropped without running.
  fn abandon_flush(&self) {
    let pending = std::mem::take(&mut self.state.rc_deref_mut().pending);
    self.flushing.store(false, Ordering::Release);
    warn!(pending = pending.len(), "mono flush task dropped without running, releasing subscriptions");
    for subscription in pending {
      subscription.release();
    }
  }

  fn flush_cycle(&self) {
    let (ready, result) = {
      let mut state = self.state.rc_deref_mut();
      let has_result = state.result.is_some();
      let mut ready = vec![];
      state.pending.retain(|subscription| match subscription.take_ready(has_result) {
        Readiness::Waiting => true,
        Readiness::Cancelled => false,
        readiness => {
          ready.push((subscription.clone(), readiness));
          false
        }
      });
      let result = if ready.is_empty() { None } else { state.result.clone() };
      (ready, result)
    };

    for (subscription, readiness) in ready {
      match (readiness, &result) {
        (Readiness::Violation(err), _) => subscription.deliver(Err(err)),
        (_, Some(result)) => subscription.deliver(result.clone()),
        (_, None) => subscription.release(),
      }
    }

    self.flushing.store(false, Ordering::Release);
    if self.has_ready() {
      self.schedule_flush();
    }
  }

  fn has_ready(&self) -> bool {
    let state = self.state.rc_deref_mut();
    let has_result = state.result.is_some();
    state.pending.iter().any(|s| s.is_ready(has_result))
  }
}

impl<T> Drop for MonoCore<T> {
  fn drop(&mut self) {
    let pending = std::mem::take(&mut self.state.rc_deref_mut().pending);
    for subscription in pending {
      subscription.release();
    }
  }
}

#[derive(Default)]
struct Flags {
  requested: bool,
  terminated: bool,
  cancelled: bool,
  violation: Option<FlowError>,
}

impl Flags {
  fn cancel(&mut self) {
    self.cancelled = true;
    self.terminated = true;
  }
}

enum Readiness {
  Waiting,
  Cancelled,
  Violation(FlowError),
  Ready,
}

/// Subscription of one consumer to a [`MonoPublisher`].
pub struct MonoSubscription<T> {
  id: SubscriptionId,
  flags: Mutex<Flags>,
  consumer: Mutex<Option<BoxedSubscriber<T>>>,
  owner: Weak<MonoCore<T>>,
}

impl<T> MonoSubscription<T> {
  #[inline]
  pub fn id(&self) -> SubscriptionId { self.id }

  fn is_ready(&self, has_result: bool) -> bool {
    let flags = self.flags.rc_deref_mut();
    flags.terminated || flags.violation.is_some() || (flags.requested && has_result)
  }

  // Marks a ready subscription terminated so it is delivered once.
  fn take_ready(&self, has_result: bool) -> Readiness {
    let mut flags = self.flags.rc_deref_mut();
    if flags.terminated {
      return Readiness::Cancelled;
    }
    if let Some(err) = flags.violation.take() {
      flags.terminated = true;
      return Readiness::Violation(err);
    }
    if flags.requested && has_result {
      flags.terminated = true;
      return Readiness::Ready;
    }
    Readiness::Waiting
  }

  fn deliver(&self, outcome: Result<T, FlowError>) {
    let Some(mut consumer) = self.consumer.rc_deref_mut().take() else {
      return;
    };
    let delivered = catch_unwind(AssertUnwindSafe(|| match outcome {
      Ok(value) => {
        consumer.on_next(value);
        if !self.flags.rc_deref_mut().cancelled {
          consumer.on_complete();
        }
      }
      Err(err) => consumer.on_error(err),
    }));
    if let Err(panic) = delivered {
      error!(
        subscription = %self.id,
        message = %FlowError::from_panic(panic.as_ref()),
        "consumer panicked while receiving mono outcome"
      );
    }
  }

  // Drops the consumer without a callback. From inside `on_subscribe` the
  // slot is held, and `subscribe` drops the consumer afterwards.
  fn release(&self) {
    self.flags.rc_deref_mut().cancel();
    match self.consumer.try_lock() {
      Ok(mut slot) => drop(slot.take()),
      Err(TryLockError::Poisoned(poisoned)) => drop(poisoned.into_inner().take()),
      Err(TryLockError::WouldBlock) => {}
    }
  }
}

impl<T: Clone + Send + 'static> Subscription for MonoSubscription<T> {
  /// Any positive demand asks for the single outcome. `n <= 0` fails this
  /// subscription alone with [`FlowError::IllegalDemand`].
  fn request(&self, n: i64) {
    {
      let mut flags = self.flags.rc_deref_mut();
      if flags.terminated {
        return;
      }
      if n <= 0 {
        warn!(subscription = %self.id, requested = n, "illegal demand on mono subscription");
        if flags.violation.is_none() {
          flags.violation = Some(FlowError::IllegalDemand { requested: n });
        }
      } else {
        flags.requested = true;
      }
    }
    if let Some(owner) = self.owner.upgrade() {
      owner.schedule_flush();
    }
  }

  fn cancel(&self) {
    {
      let mut flags = self.flags.rc_deref_mut();
      if flags.cancelled {
        return;
      }
      flags.cancel();
    }
    debug!(subscription = %self.id, "mono subscription cancelled");
    // Cancelling from `on_subscribe` finds the slot locked; `subscribe`
    // drops the consumer once the callback returned.
    match self.consumer.try_lock() {
      Ok(mut slot) => drop(slot.take()),
      Err(TryLockError::Poisoned(poisoned)) => drop(poisoned.into_inner().take()),
      Err(TryLockError::WouldBlock) => {}
    }
    if let Some(owner) = self.owner.upgrade() {
      owner.schedule_flush();
    }
  }

  fn is_closed(&self) -> bool { self.flags.rc_deref_mut().terminated }
}

struct FutureSubscriber<T> {
  tx: Option<oneshot::Sender<Result<T, FlowError>>>,
}

impl<T: Send> Subscriber<T> for FutureSubscriber<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionHandle) { subscription.request(1); }

  fn on_next(&mut self, item: T) {
    if let Some(tx) = self.tx.take() {
      let _ignore_closed = tx.send(Ok(item));
    }
  }

  fn on_error(&mut self, err: FlowError) {
    if let Some(tx) = self.tx.take() {
      let _ignore_closed = tx.send(Err(err));
    }
  }

  fn on_complete(&mut self) {}
}

pin_project! {
  /// Future returned by [`MonoPublisher::into_future`].
  pub struct MonoFuture<T> {
    #[pin]
    rx: oneshot::Receiver<Result<T, FlowError>>,
  }
}

impl<T> Future for MonoFuture<T> {
  type Output = Result<T, FlowError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match self.project().rx.poll(cx) {
      Poll::Ready(Ok(result)) => Poll::Ready(result),
      Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(FlowError::Dropped)),
      Poll::Pending => Poll::Pending,
    }
  }
}
