//! Pull-based adapter from a [`Publisher`] to a [`futures::Stream`].
//!
//! Demand follows the reader: the stream requests `prefetch` items up front
//! and tops the window up again once half of it has been consumed.
//!
//! # Example
//!
//! ```rust
//! use futures::{executor::block_on, StreamExt};
//! use rxflow::prelude::*;
//!
//! let scheduler = ManualScheduler::new();
//! let publisher = Publisher::<u32>::new("ticks", scheduler.shared());
//! let mut stream = publisher.into_stream(4);
//!
//! publisher.publish(Item::new(7));
//! publisher.close();
//! scheduler.run_tasks();
//!
//! assert_eq!(block_on(stream.next()), Some(Ok(7)));
//! assert_eq!(block_on(stream.next()), None);
//! ```

use std::{
  collections::VecDeque,
  pin::Pin,
  task::{Context, Poll, Waker},
};

use futures::stream::{FusedStream, Stream};

use crate::{
  error::FlowError,
  publisher::Publisher,
  rc::{MutArc, RcDerefMut},
  subscriber::{Subscriber, Subscription, SubscriptionHandle},
};

struct StreamState<T> {
  queue: VecDeque<Result<T, FlowError>>,
  waker: Option<Waker>,
  is_closed: bool,
  handle: Option<SubscriptionHandle>,
}

impl<T> StreamState<T> {
  fn wake(&mut self) {
    if let Some(waker) = self.waker.take() {
      waker.wake();
    }
  }
}

/// A [`Stream`] over the items of one subscription.
///
/// Yields `Ok(item)` per delivered item, then one `Err` if the subscription
/// terminated with an error, then `None`. Dropping the stream cancels the
/// subscription.
pub struct SubscriptionStream<T> {
  state: MutArc<StreamState<T>>,
  window: u64,
  consumed: u64,
  done: bool,
}

impl<T: Send + 'static> SubscriptionStream<T> {
  pub(crate) fn subscribe(publisher: &Publisher<T>, prefetch: usize) -> Self {
    let window = prefetch.max(1) as u64;
    let state = MutArc::own(StreamState {
      queue: VecDeque::new(),
      waker: None,
      is_closed: false,
      handle: None,
    });
    publisher.subscribe(StreamSubscriber { state: state.clone(), window });
    SubscriptionStream { state, window, consumed: 0, done: false }
  }
}

impl<T> SubscriptionStream<T> {
  fn replenish(&mut self) {
    self.consumed += 1;
    if self.consumed < (self.window / 2).max(1) {
      return;
    }
    let handle = self.state.rc_deref_mut().handle.clone();
    if let Some(handle) = handle {
      handle.request(self.consumed as i64);
    }
    self.consumed = 0;
  }
}

impl<T> Stream for SubscriptionStream<T> {
  type Item = Result<T, FlowError>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    if this.done {
      return Poll::Ready(None);
    }

    let next = {
      let mut state = this.state.rc_deref_mut();
      match state.queue.pop_front() {
        Some(next) => Some(next),
        None if state.is_closed => None,
        None => {
          state.waker = Some(cx.waker().clone());
          return Poll::Pending;
        }
      }
    };

    match next {
      Some(Ok(item)) => {
        this.replenish();
        Poll::Ready(Some(Ok(item)))
      }
      Some(Err(err)) => {
        this.done = true;
        Poll::Ready(Some(Err(err)))
      }
      None => {
        this.done = true;
        Poll::Ready(None)
      }
    }
  }
}

impl<T> FusedStream for SubscriptionStream<T> {
  fn is_terminated(&self) -> bool { self.done }
}

impl<T> Drop for SubscriptionStream<T> {
  fn drop(&mut self) {
    let handle = self.state.rc_deref_mut().handle.take();
    if let Some(handle) = handle {
      handle.cancel();
    }
  }
}

struct StreamSubscriber<T> {
  state: MutArc<StreamState<T>>,
  window: u64,
}

impl<T: Send> Subscriber<T> for StreamSubscriber<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
    self.state.rc_deref_mut().handle = Some(subscription.clone());
    subscription.request(self.window.min(i64::MAX as u64) as i64);
  }

  fn on_next(&mut self, item: T) {
    let mut state = self.state.rc_deref_mut();
    state.queue.push_back(Ok(item));
    state.wake();
  }

  fn on_error(&mut self, err: FlowError) {
    let mut state = self.state.rc_deref_mut();
    state.queue.push_back(Err(err));
    state.is_closed = true;
    state.handle = None;
    state.wake();
  }

  fn on_complete(&mut self) {
    let mut state = self.state.rc_deref_mut();
    state.is_closed = true;
    state.handle = None;
    state.wake();
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use futures::{executor::block_on, StreamExt};

  use super::*;
  use crate::{backpressure::Unbounded, item::Item, scheduler::ManualScheduler};

  fn publisher(scheduler: &ManualScheduler) -> Publisher<u32> {
    Publisher::with_policy("s", scheduler.shared(), Arc::new(Unbounded))
  }

  #[test]
  fn demand_follows_reader() {
    let scheduler = ManualScheduler::new();
    let publisher = publisher(&scheduler);
    let mut stream = publisher.into_stream(2);
    for i in 0..5 {
      publisher.publish(Item::new(i));
    }
    scheduler.run_tasks();
    assert_eq!(stream.state.rc_deref_mut().queue.len(), 2);

    assert_eq!(block_on(stream.next()), Some(Ok(0)));
    scheduler.run_tasks();
    assert_eq!(stream.state.rc_deref_mut().queue.len(), 2);

    publisher.close();
    let mut rest = vec![];
    loop {
      scheduler.run_tasks();
      match block_on(stream.next()) {
        Some(Ok(v)) => rest.push(v),
        other => {
          assert_eq!(other, None);
          break;
        }
      }
    }
    assert_eq!(rest, vec![1, 2, 3, 4]);
    assert!(stream.is_terminated());
  }

  #[test]
  fn error_ends_stream() {
    let scheduler = ManualScheduler::new();
    let publisher = publisher(&scheduler);
    let mut stream = publisher.into_stream(1);
    let handle = stream.state.rc_deref_mut().handle.clone().unwrap();
    handle.request(-3);
    scheduler.run_tasks();
    assert_eq!(
      block_on(stream.next()),
      Some(Err(FlowError::IllegalDemand { requested: -3 }))
    );
    assert_eq!(block_on(stream.next()), None);
  }

  #[test]
  fn drop_cancels_subscription() {
    let scheduler = ManualScheduler::new();
    let publisher = publisher(&scheduler);
    let stream = publisher.into_stream(8);
    assert_eq!(publisher.subscriber_count(), 1);
    drop(stream);
    assert_eq!(publisher.subscriber_count(), 0);
  }
}
