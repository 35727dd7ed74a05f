//! The consumer side of the streaming protocol.
//!
//! A [`Subscriber`] receives `on_subscribe` exactly once, synchronously,
//! before anything else. It then signals demand through the
//! [`Subscription`] handle it was given and receives at most that many
//! `on_next` calls, followed by at most one terminal `on_error` or
//! `on_complete`. Calls into one subscriber never overlap.

use std::sync::Arc;

use tracing::debug;

use crate::error::FlowError;

/// Handle a subscriber uses to signal demand or to stop the flow.
///
/// Both methods are fire-and-forget and may be called from any thread,
/// including from inside the subscriber's own callbacks.
pub trait Subscription: Send + Sync {
  /// Adds `n` units of demand. `n <= 0` is a protocol violation that
  /// terminates the subscription with [`FlowError::IllegalDemand`].
  fn request(&self, n: i64);

  /// Stops the flow. Buffered items are discarded, no further callback is
  /// delivered. Idempotent.
  fn cancel(&self);

  /// Whether the subscription reached its final state.
  fn is_closed(&self) -> bool;
}

pub type SubscriptionHandle = Arc<dyn Subscription>;

/// External consumer of a stream.
pub trait Subscriber<T>: Send {
  fn on_subscribe(&mut self, subscription: SubscriptionHandle);

  fn on_next(&mut self, item: T);

  fn on_error(&mut self, err: FlowError);

  fn on_complete(&mut self);
}

impl<T, S> Subscriber<T> for Box<S>
where
  S: Subscriber<T> + ?Sized,
{
  #[inline]
  fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
    (**self).on_subscribe(subscription)
  }
  #[inline]
  fn on_next(&mut self, item: T) { (**self).on_next(item) }
  #[inline]
  fn on_error(&mut self, err: FlowError) { (**self).on_error(err) }
  #[inline]
  fn on_complete(&mut self) { (**self).on_complete() }
}

pub type BoxedSubscriber<T> = Box<dyn Subscriber<T>>;

/// Subscriber that requests unbounded demand and hands every item to a
/// closure.
///
/// ```
/// use rxflow::prelude::*;
///
/// let scheduler = ManualScheduler::new();
/// let publisher = Publisher::<i32>::new("numbers", scheduler.shared());
/// let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::<i32>::new()));
/// let c_seen = seen.clone();
/// publisher.subscribe(ForEach::new(move |v: i32| c_seen.lock().unwrap().push(v)));
///
/// publisher.publish(Item::new(1));
/// publisher.publish(Item::new(2));
/// scheduler.run_tasks();
/// assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
/// ```
pub struct ForEach<F> {
  next: F,
  subscription: Option<SubscriptionHandle>,
}

impl<F> ForEach<F> {
  pub fn new(next: F) -> Self { Self { next, subscription: None } }

  /// The handle received in `on_subscribe`, if any.
  pub fn subscription(&self) -> Option<&SubscriptionHandle> { self.subscription.as_ref() }
}

impl<T, F> Subscriber<T> for ForEach<F>
where
  F: FnMut(T) + Send,
{
  fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
    subscription.request(i64::MAX);
    self.subscription = Some(subscription);
  }

  fn on_next(&mut self, item: T) { (self.next)(item) }

  fn on_error(&mut self, err: FlowError) {
    debug!(error = %err, "for_each subscriber terminated with error");
    self.subscription = None;
  }

  fn on_complete(&mut self) { self.subscription = None; }
}
