//! Multicast publisher of one named stream.
//!
//! Publishing reads an immutable snapshot of the current subscriptions, so it
//! never contends with the registry lock taken by subscribe and unsubscribe.
//! Each subscription receives its own clone of the payload (the last one
//! receives the original) and a share of the item's completion.

mod fan_out;

use std::{
  fmt::{Debug, Formatter},
  sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use tracing::{debug, trace};

pub(crate) use self::fan_out::FanOutTracker;
use crate::{
  backpressure::BackpressurePolicy,
  config::PolicyConfig,
  error::FlowError,
  item::{Completion, Item},
  rc::RcDerefMut,
  scheduler::SharedScheduler,
  stream::SubscriptionStream,
  subscriber::Subscriber,
  subscription::{StreamSubscription, SubscriptionId},
};

type Subscriptions<T> = Vec<Arc<StreamSubscription<T>>>;

pub(crate) struct PublisherCore<T> {
  name: Arc<str>,
  scheduler: SharedScheduler,
  policy: Arc<dyn BackpressurePolicy<T>>,
  registry: Mutex<Registry<T>>,
  snapshot: ArcSwap<Subscriptions<T>>,
}

struct Registry<T> {
  closed: bool,
  subscriptions: Subscriptions<T>,
}

impl<T: Send + 'static> PublisherCore<T> {
  // Callers hold the registry lock, so snapshots are stored in registry order.
  fn refresh(&self, registry: &Registry<T>) {
    self.snapshot.store(Arc::new(registry.subscriptions.clone()));
  }

  fn attach(&self, subscription: &Arc<StreamSubscription<T>>) -> bool {
    let mut registry = self.registry.rc_deref_mut();
    if registry.closed {
      return false;
    }
    registry.subscriptions.push(subscription.clone());
    self.refresh(&registry);
    true
  }

  /// Removes a subscription from future fan-outs. Idempotent.
  pub(crate) fn unsubscribe(&self, id: SubscriptionId) {
    let mut registry = self.registry.rc_deref_mut();
    let before = registry.subscriptions.len();
    registry.subscriptions.retain(|s| s.id() != id);
    if registry.subscriptions.len() != before {
      self.refresh(&registry);
      trace!(stream = %self.name, subscription = %id, "subscription detached");
    }
  }
}

/// Handle to a named stream. Clones share the same subscriptions.
pub struct Publisher<T> {
  core: Arc<PublisherCore<T>>,
}

impl<T> Clone for Publisher<T> {
  fn clone(&self) -> Self { Self { core: self.core.clone() } }
}

impl<T: Send + 'static> Publisher<T> {
  /// Creates a publisher with the default [`PolicyConfig`].
  pub fn new(name: impl Into<Arc<str>>, scheduler: SharedScheduler) -> Self {
    Self::with_policy(name, scheduler, PolicyConfig::default().build())
  }

  pub fn with_policy(
    name: impl Into<Arc<str>>,
    scheduler: SharedScheduler,
    policy: Arc<dyn BackpressurePolicy<T>>,
  ) -> Self {
    Self {
      core: Arc::new(PublisherCore {
        name: name.into(),
        scheduler,
        policy,
        registry: Mutex::new(Registry { closed: false, subscriptions: vec![] }),
        snapshot: ArcSwap::from_pointee(vec![]),
      }),
    }
  }

  #[inline]
  pub fn name(&self) -> &str { &self.core.name }

  /// Number of subscriptions future items are fanned out to.
  pub fn subscriber_count(&self) -> usize { self.core.snapshot.load().len() }

  pub fn is_closed(&self) -> bool { self.core.registry.rc_deref_mut().closed }

  /// Subscribes `subscriber`.
  ///
  /// `on_subscribe` runs synchronously on the calling thread before this
  /// returns. Subscribing to a closed publisher completes the subscription
  /// right after `on_subscribe`.
  pub fn subscribe<S>(&self, subscriber: S) -> Arc<StreamSubscription<T>>
  where
    S: Subscriber<T> + 'static,
  {
    let subscription = StreamSubscription::new(
      self.core.name.clone(),
      Arc::downgrade(&self.core),
      self.core.scheduler.clone(),
      self.core.policy.clone(),
      Box::new(subscriber),
    );
    subscription.start(|s| self.core.attach(s));
    subscription
  }

  /// Detaches the subscription `id` without signalling its consumer.
  pub fn unsubscribe(&self, id: SubscriptionId) { self.core.unsubscribe(id) }

  /// Fans `item` out to every current subscription.
  ///
  /// The item's completion fires once every subscription resolved its copy,
  /// carrying the first error any of them reported. Without subscriptions
  /// it fires right away with [`FlowError::NoActiveSubscriptions`].
  pub fn publish(&self, item: Item<T>)
  where
    T: Clone,
  {
    let snapshot = self.core.snapshot.load_full();
    if snapshot.is_empty() {
      debug!(stream = %self.core.name, "no active subscriptions, rejecting item");
      item.fail(FlowError::NoActiveSubscriptions { stream: self.core.name.to_string() });
      return;
    }

    let (payload, completion) = item.into_parts();
    let mut targets = snapshot
      .iter()
      .zip(FanOutTracker::split(completion, snapshot.len()))
      .peekable();
    while let Some((subscription, share)) = targets.next() {
      if targets.peek().is_some() {
        subscription.publish(Item::from_parts(payload.clone(), share));
      } else {
        subscription.publish(Item::from_parts(payload, share));
        break;
      }
    }
  }

  /// Shorthand for publishing `payload` with an `on_processed` callback.
  pub fn publish_with<F>(&self, payload: T, on_processed: F)
  where
    T: Clone,
    F: FnOnce(Option<T>, Option<FlowError>) + Send + 'static,
  {
    self.publish(Item::from_parts(payload, Completion::new(on_processed)))
  }

  /// Stops accepting subscriptions and asks every current subscription to
  /// complete once its buffer is drained. Idempotent.
  pub fn close(&self) {
    let subscriptions = {
      let mut registry = self.core.registry.rc_deref_mut();
      if registry.closed {
        return;
      }
      registry.closed = true;
      let subscriptions = std::mem::take(&mut registry.subscriptions);
      self.core.refresh(&registry);
      subscriptions
    };
    debug!(stream = %self.core.name, subscriptions = subscriptions.len(), "publisher closed");
    for subscription in subscriptions {
      subscription.signal_completion();
    }
  }

  /// Subscribes a pull-based [`futures::Stream`] that keeps up to `prefetch`
  /// items requested ahead of the reader.
  pub fn into_stream(&self, prefetch: usize) -> SubscriptionStream<T> {
    SubscriptionStream::subscribe(self, prefetch)
  }
}

impl<T> Debug for Publisher<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Publisher")
      .field("name", &self.core.name)
      .field("subscribers", &self.core.snapshot.load().len())
      .finish()
  }
}
