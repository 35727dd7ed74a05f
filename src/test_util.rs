use crate::{
  error::FlowError,
  item::Item,
  rc::{MutArc, RcDerefMut},
  subscriber::{Subscriber, Subscription, SubscriptionHandle},
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event<T> {
  Subscribed,
  Next(T),
  Error(FlowError),
  Complete,
}

struct Inner<T> {
  events: Vec<Event<T>>,
  handle: Option<SubscriptionHandle>,
  received: usize,
}

/// Subscriber recording every callback, optionally misbehaving.
pub(crate) struct Recorder<T> {
  inner: MutArc<Inner<T>>,
  initial: i64,
  cancel_after: Option<usize>,
  panic_on: Option<usize>,
}

impl<T> Clone for Recorder<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
      initial: self.initial,
      cancel_after: self.cancel_after,
      panic_on: self.panic_on,
    }
  }
}

impl<T> Recorder<T> {
  /// Requests `initial` in `on_subscribe` unless it is zero.
  pub(crate) fn new(initial: i64) -> Self {
    Self {
      inner: MutArc::own(Inner { events: vec![], handle: None, received: 0 }),
      initial,
      cancel_after: None,
      panic_on: None,
    }
  }

  /// Cancels from inside `on_next` once `count` items arrived.
  pub(crate) fn cancel_after(mut self, count: usize) -> Self {
    self.cancel_after = Some(count);
    self
  }

  /// Panics when receiving the item at `index`.
  pub(crate) fn panic_on(mut self, index: usize) -> Self {
    self.panic_on = Some(index);
    self
  }

  pub(crate) fn handle(&self) -> Option<SubscriptionHandle> { self.inner.rc_deref_mut().handle.clone() }

  pub(crate) fn request(&self, n: i64) {
    if let Some(handle) = self.handle() {
      handle.request(n);
    }
  }
}

impl<T: Clone> Recorder<T> {
  pub(crate) fn events(&self) -> Vec<Event<T>> { self.inner.rc_deref_mut().events.clone() }

  pub(crate) fn nexts(&self) -> Vec<T> {
    self
      .inner
      .rc_deref_mut()
      .events
      .iter()
      .filter_map(|e| match e {
        Event::Next(v) => Some(v.clone()),
        _ => None,
      })
      .collect()
  }
}

impl<T: Send> Subscriber<T> for Recorder<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
    {
      let mut inner = self.inner.rc_deref_mut();
      inner.events.push(Event::Subscribed);
      inner.handle = Some(subscription.clone());
    }
    if self.initial != 0 {
      subscription.request(self.initial);
    }
  }

  fn on_next(&mut self, item: T) {
    let (received, handle) = {
      let mut inner = self.inner.rc_deref_mut();
      let index = inner.received;
      if self.panic_on == Some(index) {
        drop(inner);
        panic!("panic on {index}");
      }
      inner.received += 1;
      inner.events.push(Event::Next(item));
      (inner.received, inner.handle.clone())
    };
    if self.cancel_after == Some(received) {
      if let Some(handle) = handle {
        handle.cancel();
      }
    }
  }

  fn on_error(&mut self, err: FlowError) { self.inner.rc_deref_mut().events.push(Event::Error(err)); }

  fn on_complete(&mut self) { self.inner.rc_deref_mut().events.push(Event::Complete); }
}

pub(crate) type Outcome<T> = (Option<T>, Option<FlowError>);

/// Collects what an item's completion callback receives.
pub(crate) struct Outcomes<T>(MutArc<Vec<Outcome<T>>>);

impl<T> Outcomes<T> {
  pub(crate) fn take(&self) -> Vec<Outcome<T>> { std::mem::take(&mut *self.0.rc_deref_mut()) }
}

pub(crate) fn tracked<T: Send + 'static>(payload: T) -> (Item<T>, Outcomes<T>) {
  let outcomes = MutArc::own(vec![]);
  let c_outcomes = outcomes.clone();
  let item = Item::with_completion(payload, move |item, err| {
    c_outcomes.rc_deref_mut().push((item, err));
  });
  (item, Outcomes(outcomes))
}
