//! Demand-driven subscription of one consumer to one publisher.
//!
//! # State machine
//!
//! ```text
//!   Active ──signal_completion──▶ Terminating ──buffer drained──▶ Terminated
//!     │                               │                              ▲
//!     └──── cancel / illegal demand / consumer or policy panic ──────┘
//! ```
//!
//! Independently of the lifecycle, the `sending` flag records that a flush
//! task is queued or running on the worker pool. At most one such task
//! exists per subscription, which is what keeps consumer callbacks
//! sequential: only the flush task ever calls into the consumer, apart from
//! the synchronous `on_subscribe`.
//!
//! The state lock is never held while calling the consumer or resolving item
//! completions, so both may call back into the subscription.
//!
//! A flush task that the worker pool drops without running, because it shut
//! down or rejected the task, force-cancels its subscription: the buffer is
//! discarded with [`FlowError::Rejected`] and the consumer is dropped without
//! a terminal callback.

use std::{
  fmt::{Debug, Display, Formatter},
  panic::{catch_unwind, AssertUnwindSafe},
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, TryLockError, Weak,
  },
};

use tracing::{debug, error, trace, warn};

use crate::{
  backpressure::{BackpressurePolicy, Buffer, Evicted},
  error::FlowError,
  item::{Completion, Item},
  publisher::PublisherCore,
  rc::RcDerefMut,
  scheduler::{SharedScheduler, Task},
  subscriber::{BoxedSubscriber, Subscription},
};

/// Process-unique identity of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
  pub(crate) fn next() -> Self {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    SubscriptionId(NEXT.fetch_add(1, Ordering::Relaxed))
  }

  #[inline]
  pub fn get(&self) -> u64 { self.0 }
}

impl Display for SubscriptionId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "sub-{}", self.0) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
  Active,
  /// Completion requested, the buffer is still draining.
  Terminating,
  /// Final. No `on_next` is delivered from here on.
  Terminated,
}

enum Terminal {
  Complete,
  Error(FlowError),
}

struct State<T> {
  lifecycle: Lifecycle,
  sending: bool,
  demand: u64,
  buffer: Buffer<T>,
  // Terminal signal waiting for the flush task.
  terminal: Option<Terminal>,
  // The consumer has been dropped.
  released: bool,
  // Force-cancelled: whoever holds the consumer slot drops the consumer.
  orphaned: bool,
}

impl<T> State<T> {
  fn is_flushable(&self) -> bool {
    self.lifecycle != Lifecycle::Terminated && self.demand > 0 && !self.buffer.is_empty()
  }

  fn needs_signal(&self) -> bool {
    self.terminal.is_some() || (self.lifecycle == Lifecycle::Terminated && !self.released)
  }

  fn terminate(&mut self) -> Buffer<T> {
    self.lifecycle = Lifecycle::Terminated;
    std::mem::take(&mut self.buffer)
  }
}

enum Admission<T> {
  Buffered(Evicted<T>),
  Rejected(Item<T>),
  PolicyFailed(Buffer<T>, Option<Parked<T>>, FlowError),
}

type Parked<T> = Arc<Mutex<Option<Completion<T>>>>;

/// Swaps an armed completion for one forwarding to it, except while the
/// thread unwinds. Should the policy panic while owning the item, the real
/// completion stays parked and is resolved once the state lock is released.
fn park<T: Send + 'static>(item: Item<T>) -> (Item<T>, Option<Parked<T>>) {
  let (payload, completion) = item.into_parts();
  if !completion.is_armed() {
    return (Item::from_parts(payload, completion), None);
  }
  let parked = Arc::new(Mutex::new(Some(completion)));
  let c_parked = parked.clone();
  let forward = Completion::new(move |item, err| {
    if std::thread::panicking() {
      return;
    }
    let completion = c_parked.rc_deref_mut().take();
    if let Some(completion) = completion {
      completion.resolve(item, err);
    }
  });
  (Item::from_parts(payload, forward), Some(parked))
}

/// Flush work handed to the scheduler.
struct FlushTask<T: Send + 'static>(Option<Arc<StreamSubscription<T>>>);

impl<T: Send + 'static> FlushTask<T> {
  fn run(mut self) {
    if let Some(subscription) = self.0.take() {
      subscription.flush_cycle();
    }
  }
}

impl<T: Send + 'static> Drop for FlushTask<T> {
  fn drop(&mut self) {
    if let Some(subscription) = self.0.take() {
      subscription.abort_flush();
    }
  }
}

/// Subscription of one [`Subscriber`](crate::subscriber::Subscriber) to a
/// [`Publisher`](crate::publisher::Publisher).
pub struct StreamSubscription<T> {
  id: SubscriptionId,
  stream: Arc<str>,
  owner: Weak<PublisherCore<T>>,
  scheduler: SharedScheduler,
  policy: Arc<dyn BackpressurePolicy<T>>,
  state: Mutex<State<T>>,
  consumer: Mutex<Option<BoxedSubscriber<T>>>,
  this: Weak<StreamSubscription<T>>,
}

fn discard<T>(items: impl IntoIterator<Item = Item<T>>, error: &FlowError) {
  for item in items {
    item.fail(error.clone());
  }
}

impl<T: Send + 'static> StreamSubscription<T> {
  pub(crate) fn new(
    stream: Arc<str>,
    owner: Weak<PublisherCore<T>>,
    scheduler: SharedScheduler,
    policy: Arc<dyn BackpressurePolicy<T>>,
    consumer: BoxedSubscriber<T>,
  ) -> Arc<Self> {
    Arc::new_cyclic(|this| StreamSubscription {
      id: SubscriptionId::next(),
      stream,
      owner,
      scheduler,
      policy,
      state: Mutex::new(State {
        lifecycle: Lifecycle::Active,
        sending: false,
        demand: 0,
        buffer: Buffer::new(),
        terminal: None,
        released: false,
        orphaned: false,
      }),
      consumer: Mutex::new(Some(consumer)),
      this: this.clone(),
    })
  }

  #[inline]
  pub fn id(&self) -> SubscriptionId { self.id }

  #[inline]
  pub fn stream(&self) -> &str { &self.stream }

  pub fn lifecycle(&self) -> Lifecycle { self.state.rc_deref_mut().lifecycle }

  /// Outstanding demand not yet consumed by deliveries.
  pub fn demand(&self) -> u64 { self.state.rc_deref_mut().demand }

  /// Number of buffered items waiting for demand.
  pub fn buffered(&self) -> usize { self.state.rc_deref_mut().buffer.len() }

  /// Registers the subscription through `attach` and hands it to the
  /// consumer's `on_subscribe`.
  ///
  /// The consumer slot stays locked for the whole call, so a flush task
  /// scheduled in between cannot reach the consumer before `on_subscribe`
  /// returned. `attach` returns `false` when the publisher is already closed,
  /// in which case the subscription completes right away.
  pub(crate) fn start(self: &Arc<Self>, attach: impl FnOnce(&Arc<Self>) -> bool) {
    let mut slot = self.consumer.rc_deref_mut();
    let attached = attach(self);
    debug!(stream = %self.stream, subscription = %self.id, attached, "subscription created");
    let panicked = match slot.as_mut() {
      Some(consumer) => {
        let handle = self.clone();
        catch_unwind(AssertUnwindSafe(|| consumer.on_subscribe(handle))).err()
      }
      None => None,
    };
    drop(slot);
    if self.state.rc_deref_mut().orphaned {
      drop(self.consumer.rc_deref_mut().take());
    }

    if let Some(panic) = panicked {
      error!(
        stream = %self.stream,
        subscription = %self.id,
        message = %FlowError::from_panic(panic.as_ref()),
        "consumer panicked in on_subscribe, cancelling"
      );
      self.cancel();
    } else if !attached {
      self.signal_completion();
    }
  }

  /// Admits an item through the backpressure policy.
  ///
  /// Items arriving once completion was requested are resolved with
  /// [`FlowError::SubscriptionClosed`] instead of being buffered.
  pub(crate) fn publish(&self, item: Item<T>) {
    let admission = {
      let mut state = self.state.rc_deref_mut();
      if state.lifecycle == Lifecycle::Active {
        let (item, parked) = park(item);
        let buffer = &mut state.buffer;
        match catch_unwind(AssertUnwindSafe(|| self.policy.apply(buffer, item))) {
          Ok(evicted) => Admission::Buffered(evicted),
          Err(panic) => {
            let err = FlowError::PolicyPanicked {
              policy: self.policy.name(),
              message: FlowError::from_panic(panic.as_ref()),
            };
            state.terminal = Some(Terminal::Error(err.clone()));
            Admission::PolicyFailed(state.terminate(), parked, err)
          }
        }
      } else {
        Admission::Rejected(item)
      }
    };

    match admission {
      Admission::Buffered(evicted) => {
        if !evicted.is_empty() {
          debug!(
            stream = %self.stream,
            subscription = %self.id,
            policy = self.policy.name(),
            count = evicted.len(),
            "backpressure policy evicted items"
          );
          discard(evicted, &FlowError::DiscardedByPolicy { policy: self.policy.name() });
        }
      }
      Admission::Rejected(item) => {
        trace!(stream = %self.stream, subscription = %self.id, "item rejected by closed subscription");
        item.fail(FlowError::SubscriptionClosed);
      }
      Admission::PolicyFailed(remaining, parked, err) => {
        error!(stream = %self.stream, subscription = %self.id, error = %err, "terminating subscription");
        self.detach();
        discard(remaining, &err);
        if let Some(parked) = parked {
          let completion = parked.rc_deref_mut().take();
          if let Some(completion) = completion {
            completion.fail(None, err);
          }
        }
      }
    }
    self.check_and_flush();
  }

  /// Requests completion. `on_complete` is delivered once every buffered
  /// item has been delivered.
  pub fn signal_completion(&self) {
    {
      let mut state = self.state.rc_deref_mut();
      if state.lifecycle == Lifecycle::Active {
        state.lifecycle = Lifecycle::Terminating;
      }
    }
    self.check_and_flush();
  }

  /// Decides whether a flush task should start now and submits it.
  fn check_and_flush(&self) {
    let (start, finalized) = {
      let mut state = self.state.rc_deref_mut();
      if state.sending {
        return;
      }
      let finalized = state.lifecycle == Lifecycle::Terminating && state.buffer.is_empty();
      if finalized {
        state.lifecycle = Lifecycle::Terminated;
        state.terminal = Some(Terminal::Complete);
      }
      let start = state.is_flushable() || state.needs_signal();
      state.sending = start;
      (start, finalized)
    };

    if finalized {
      debug!(stream = %self.stream, subscription = %self.id, "subscription drained, completing");
      self.detach();
    }
    if start {
      self.schedule_flush();
    }
  }

  fn schedule_flush(&self) {
    let Some(this) = self.this.upgrade() else {
      return;
    };
    let task = FlushTask(Some(this));
    let task: Task = Box::new(move || task.run());
    // A rejected task was dropped inside `submit` and already cancelled us.
    if let Err(err) = self.scheduler.submit(task) {
      debug!(stream = %self.stream, subscription = %self.id, error = %err, "flush task rejected");
    }
  }

  /// Force-cancels the subscription of a flush task that will never run.
  fn abort_flush(&self) {
    let remaining = {
      let mut state = self.state.rc_deref_mut();
      if !state.sending {
        return;
      }
      state.sending = false;
      state.released = true;
      state.orphaned = true;
      state.terminal = None;
      state.terminate()
    };
    warn!(
      stream = %self.stream,
      subscription = %self.id,
      discarded = remaining.len(),
      "flush task dropped without running, terminating subscription"
    );
    // A rejected submit can happen inside `on_subscribe`, which holds the
    // consumer slot on this very thread.
    match self.consumer.try_lock() {
      Ok(mut slot) => drop(slot.take()),
      Err(TryLockError::Poisoned(poisoned)) => drop(poisoned.into_inner().take()),
      Err(TryLockError::WouldBlock) => {}
    }
    self.detach();
    discard(remaining, &FlowError::Rejected);
  }

  fn flush_cycle(&self) {
    self.flush();
    self.deliver_terminal();
    self.state.rc_deref_mut().sending = false;
    self.check_and_flush();
  }

  /// Delivers up to `demand` buffered items, in order.
  fn flush(&self) {
    let batch: Vec<Item<T>> = {
      let mut state = self.state.rc_deref_mut();
      if state.lifecycle == Lifecycle::Terminated {
        return;
      }
      let amount = state.demand.min(state.buffer.len() as u64);
      state.demand -= amount;
      state.buffer.drain(..amount as usize).collect()
    };
    if batch.is_empty() {
      return;
    }
    trace!(stream = %self.stream, subscription = %self.id, count = batch.len(), "flushing");

    let mut consumer = self.consumer.rc_deref_mut();
    let mut batch = batch.into_iter();
    while let Some(item) = batch.next() {
      let (payload, completion) = item.into_parts();
      let outcome = match consumer.as_mut() {
        Some(subscriber) => catch_unwind(AssertUnwindSafe(|| subscriber.on_next(payload))),
        None => {
          completion.fail(Some(payload), FlowError::SubscriptionCancelled);
          continue;
        }
      };

      if let Err(panic) = outcome {
        drop(consumer);
        let err = FlowError::ConsumerPanicked { message: FlowError::from_panic(panic.as_ref()) };
        error!(stream = %self.stream, subscription = %self.id, error = %err, "terminating subscription");
        completion.fail(None, err.clone());
        let remaining = {
          let mut state = self.state.rc_deref_mut();
          if state.lifecycle != Lifecycle::Terminated {
            state.terminal = Some(Terminal::Error(err));
          }
          state.terminate()
        };
        self.detach();
        discard(batch.chain(remaining), &FlowError::SubscriptionCancelled);
        return;
      }
      completion.succeed();

      if self.state.rc_deref_mut().lifecycle == Lifecycle::Terminated {
        drop(consumer);
        discard(batch, &FlowError::SubscriptionCancelled);
        return;
      }
    }
  }

  /// Delivers a pending terminal signal and drops the consumer of a
  /// terminated subscription.
  fn deliver_terminal(&self) {
    let terminal = {
      let mut state = self.state.rc_deref_mut();
      if state.lifecycle != Lifecycle::Terminated || state.released {
        return;
      }
      state.released = true;
      state.terminal.take()
    };
    let Some(mut consumer) = self.consumer.rc_deref_mut().take() else {
      return;
    };

    let outcome = match terminal {
      Some(Terminal::Complete) => catch_unwind(AssertUnwindSafe(|| consumer.on_complete())),
      Some(Terminal::Error(err)) => catch_unwind(AssertUnwindSafe(|| consumer.on_error(err))),
      None => Ok(()),
    };
    if let Err(panic) = outcome {
      error!(
        stream = %self.stream,
        subscription = %self.id,
        message = %FlowError::from_panic(panic.as_ref()),
        "consumer panicked in terminal callback"
      );
    }
    debug!(stream = %self.stream, subscription = %self.id, "subscription released");
  }

  fn detach(&self) {
    if let Some(owner) = self.owner.upgrade() {
      owner.unsubscribe(self.id);
    }
  }
}

impl<T: Send + 'static> Subscription for StreamSubscription<T> {
  fn request(&self, n: i64) {
    if n <= 0 {
      let remaining = {
        let mut state = self.state.rc_deref_mut();
        if state.lifecycle == Lifecycle::Terminated {
          return;
        }
        state.terminal = Some(Terminal::Error(FlowError::IllegalDemand { requested: n }));
        state.terminate()
      };
      warn!(stream = %self.stream, subscription = %self.id, requested = n, "illegal demand, terminating subscription");
      self.detach();
      discard(remaining, &FlowError::SubscriptionCancelled);
    } else {
      let mut state = self.state.rc_deref_mut();
      if state.lifecycle == Lifecycle::Terminated {
        return;
      }
      state.demand = state.demand.saturating_add(n as u64);
    }
    self.check_and_flush();
  }

  fn cancel(&self) {
    self.detach();
    let remaining = {
      let mut state = self.state.rc_deref_mut();
      if state.lifecycle == Lifecycle::Terminated {
        state.terminal = None;
        return;
      }
      state.terminate()
    };
    debug!(stream = %self.stream, subscription = %self.id, discarded = remaining.len(), "subscription cancelled");
    discard(remaining, &FlowError::SubscriptionCancelled);
    self.check_and_flush();
  }

  fn is_closed(&self) -> bool { self.lifecycle() == Lifecycle::Terminated }
}

impl<T> Debug for StreamSubscription<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let state = self.state.rc_deref_mut();
    f.debug_struct("StreamSubscription")
      .field("id", &self.id)
      .field("stream", &self.stream)
      .field("lifecycle", &state.lifecycle)
      .field("sending", &state.sending)
      .field("demand", &state.demand)
      .field("buffered", &state.buffer.len())
      .finish()
  }
}
