//! Registry of named streams sharing one worker pool.
//!
//! The pipeline side talks to the service by stream name: it publishes items
//! to external subscribers, and it can attach one [`StreamConsumer`] per name
//! to receive items sent in the other direction, including request/reply
//! exchanges answered through a [`MonoPublisher`].
//!
//! # Example
//!
//! ```rust
//! use rxflow::prelude::*;
//!
//! let scheduler = ManualScheduler::new();
//! let service = StreamService::<String>::new(ServiceConfig::default());
//! service.start_with(scheduler.shared()).unwrap();
//!
//! service
//!   .attach_consumer("echo", |item: Item<String>| item.processed())
//!   .unwrap();
//! let reply = service.request_reply("echo", "ping".to_owned()).unwrap();
//!
//! let answer = reply.into_future();
//! scheduler.run_tasks();
//! assert_eq!(futures::executor::block_on(answer), Ok("ping".to_owned()));
//! ```

use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  time::Duration,
};

use tracing::{debug, info, warn};

#[cfg(feature = "futures-scheduler")]
use crate::scheduler::new_thread_pool;
use crate::{
  config::ServiceConfig,
  error::FlowError,
  item::Item,
  mono::MonoPublisher,
  publisher::Publisher,
  rc::RcDerefMut,
  scheduler::{SharedScheduler, WorkerPool},
  subscriber::Subscriber,
  subscription::StreamSubscription,
};

/// Pipeline-side consumer of one named stream.
///
/// `accept` runs on the thread calling [`StreamService::send`] or
/// [`StreamService::request_reply`]. The consumer owns the item from then on
/// and resolves it with [`Item::processed`] or [`Item::fail`].
pub trait StreamConsumer<T>: Send + Sync {
  fn accept(&self, item: Item<T>);
}

impl<T, F> StreamConsumer<T> for F
where
  F: Fn(Item<T>) + Send + Sync,
{
  #[inline]
  fn accept(&self, item: Item<T>) { self(item) }
}

type SharedConsumer<T> = Arc<dyn StreamConsumer<T>>;

pub struct StreamService<T> {
  config: ServiceConfig,
  pool: Mutex<Option<WorkerPool>>,
  publishers: Mutex<HashMap<String, Publisher<T>>>,
  consumers: Mutex<HashMap<String, SharedConsumer<T>>>,
}

impl<T: Clone + Send + 'static> StreamService<T> {
  pub fn new(config: ServiceConfig) -> Self {
    Self {
      config,
      pool: Mutex::new(None),
      publishers: Mutex::new(HashMap::new()),
      consumers: Mutex::new(HashMap::new()),
    }
  }

  #[inline]
  pub fn config(&self) -> &ServiceConfig { &self.config }

  pub fn is_running(&self) -> bool { self.pool.rc_deref_mut().is_some() }

  /// Starts the service on a `futures` thread pool sized by the
  /// configuration.
  #[cfg(feature = "futures-scheduler")]
  pub fn start(&self) -> Result<(), FlowError> {
    if self.is_running() {
      return Err(FlowError::AlreadyStarted);
    }
    let pool = new_thread_pool(&self.config)?;
    self.start_with(Arc::new(pool))
  }

  /// Starts the service on a caller-provided scheduler.
  pub fn start_with(&self, scheduler: SharedScheduler) -> Result<(), FlowError> {
    let mut pool = self.pool.rc_deref_mut();
    if pool.is_some() {
      return Err(FlowError::AlreadyStarted);
    }
    *pool = Some(WorkerPool::new(scheduler));
    info!(worker_threads = self.config.worker_threads, "stream service started");
    Ok(())
  }

  /// Closes every stream and waits up to the configured grace period for
  /// in-flight deliveries.
  ///
  /// Attached consumers stay attached. The service can be started again.
  pub fn stop(&self) -> Result<(), FlowError> {
    let (pool, publishers) = {
      let mut pool = self.pool.rc_deref_mut();
      let Some(pool) = pool.take() else {
        return Err(FlowError::NotStarted);
      };
      let publishers: Vec<_> = self.publishers.rc_deref_mut().drain().map(|(_, p)| p).collect();
      (pool, publishers)
    };

    info!(streams = publishers.len(), grace = ?self.config.shutdown_grace, "stopping stream service");
    for publisher in &publishers {
      publisher.close();
    }
    let res = pool.shutdown(self.config.shutdown_grace);
    if let Err(err) = &res {
      warn!(error = %err, "stream service stopped before draining");
    }
    res
  }

  /// The publisher of stream `name`, created on first use.
  pub fn publisher(&self, name: &str) -> Result<Publisher<T>, FlowError> {
    let pool = self.pool.rc_deref_mut();
    let Some(pool) = pool.as_ref() else {
      return Err(FlowError::NotStarted);
    };
    let mut publishers = self.publishers.rc_deref_mut();
    let publisher = publishers.entry(name.to_owned()).or_insert_with(|| {
      debug!(stream = name, policy = ?self.config.policy, "stream created");
      Publisher::with_policy(name, Arc::new(pool.clone()), self.config.policy.build())
    });
    Ok(publisher.clone())
  }

  /// Publishes `payload` to every subscriber of `name`.
  ///
  /// `on_processed` fires once every subscriber delivered or discarded the
  /// item, or right away with [`FlowError::NotStarted`] or
  /// [`FlowError::NoActiveSubscriptions`].
  pub fn publish<F>(&self, name: &str, payload: T, on_processed: F)
  where
    F: FnOnce(Option<T>, Option<FlowError>) + Send + 'static,
  {
    match self.publisher(name) {
      Ok(publisher) => publisher.publish_with(payload, on_processed),
      Err(err) => {
        debug!(stream = name, error = %err, "publish rejected");
        on_processed(Some(payload), Some(err));
      }
    }
  }

  pub fn subscribe<S>(&self, name: &str, subscriber: S) -> Result<Arc<StreamSubscription<T>>, FlowError>
  where
    S: Subscriber<T> + 'static,
  {
    Ok(self.publisher(name)?.subscribe(subscriber))
  }

  /// Closes stream `name`. Returns `false` if it did not exist.
  pub fn close_stream(&self, name: &str) -> bool {
    let publisher = self.publishers.rc_deref_mut().remove(name);
    match publisher {
      Some(publisher) => {
        publisher.close();
        true
      }
      None => false,
    }
  }

  /// Names of the open streams, sorted.
  pub fn stream_names(&self) -> Vec<String> {
    let mut names: Vec<_> = self.publishers.rc_deref_mut().keys().cloned().collect();
    names.sort();
    names
  }

  pub fn subscriber_count(&self, name: &str) -> usize {
    self.publishers.rc_deref_mut().get(name).map_or(0, |p| p.subscriber_count())
  }

  /// Attaches the pipeline consumer of stream `name`.
  pub fn attach_consumer<C>(&self, name: &str, consumer: C) -> Result<(), FlowError>
  where
    C: StreamConsumer<T> + 'static,
  {
    let mut consumers = self.consumers.rc_deref_mut();
    if consumers.contains_key(name) {
      return Err(FlowError::ConsumerAlreadyAttached { stream: name.to_owned() });
    }
    consumers.insert(name.to_owned(), Arc::new(consumer));
    debug!(stream = name, "consumer attached");
    Ok(())
  }

  /// Detaches the pipeline consumer of `name`. Returns `false` if none was
  /// attached.
  pub fn detach_consumer(&self, name: &str) -> bool {
    let detached = self.consumers.rc_deref_mut().remove(name).is_some();
    if detached {
      debug!(stream = name, "consumer detached");
    }
    detached
  }

  fn consumer(&self, name: &str) -> Result<SharedConsumer<T>, FlowError> {
    self
      .consumers
      .rc_deref_mut()
      .get(name)
      .cloned()
      .ok_or_else(|| FlowError::NoConsumerAttached { stream: name.to_owned() })
  }

  /// Hands `item` to the consumer attached to `name`.
  pub fn send(&self, name: &str, item: Item<T>) {
    match self.consumer(name) {
      Ok(consumer) => consumer.accept(item),
      Err(err) => {
        debug!(stream = name, "send without consumer");
        item.fail(err);
      }
    }
  }

  /// Sends `payload` to the consumer attached to `name` and returns a
  /// publisher of its reply.
  ///
  /// The reply is the payload the consumer hands back with
  /// [`Item::processed`], or the error it fails the item with. An item
  /// resolved with neither fails with [`FlowError::EmptyReply`].
  pub fn request_reply(&self, name: &str, payload: T) -> Result<MonoPublisher<T>, FlowError> {
    let scheduler: SharedScheduler = match self.pool.rc_deref_mut().as_ref() {
      Some(pool) => Arc::new(pool.clone()),
      None => return Err(FlowError::NotStarted),
    };
    let consumer = self.consumer(name)?;

    let reply = MonoPublisher::new(scheduler);
    let c_reply = reply.clone();
    consumer.accept(Item::with_completion(payload, move |item, err| {
      let _ignore_finalized = match (item, err) {
        (_, Some(err)) => c_reply.set_exception(err),
        (Some(value), None) => c_reply.set_data(value),
        (None, None) => c_reply.set_exception(FlowError::EmptyReply),
      };
    }));
    Ok(reply)
  }
}

impl<T> Drop for StreamService<T> {
  fn drop(&mut self) {
    self.publishers.rc_deref_mut().clear();
    if let Some(pool) = self.pool.rc_deref_mut().take() {
      let _ignore_timeout = pool.shutdown(Duration::ZERO);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    rc::MutArc,
    scheduler::ManualScheduler,
    subscriber::Subscription,
    test_util::{tracked, Event, Recorder},
  };

  fn started() -> (StreamService<String>, ManualScheduler) {
    let scheduler = ManualScheduler::new();
    let service = StreamService::new(ServiceConfig {
      shutdown_grace: Duration::from_millis(20),
      ..ServiceConfig::default()
    });
    service.start_with(scheduler.shared()).unwrap();
    (service, scheduler)
  }

  #[test]
  fn not_started_paths() {
    let service = StreamService::<String>::new(ServiceConfig::default());
    let (item, outcome) = tracked("x".to_owned());
    let (payload, completion) = item.into_parts();
    service.publish("s", payload, move |item, err| completion.resolve(item, err));
    assert_eq!(outcome.take(), vec![(Some("x".to_owned()), Some(FlowError::NotStarted))]);
    assert_eq!(service.subscribe("s", Recorder::new(1)).err(), Some(FlowError::NotStarted));
    assert_eq!(service.request_reply("s", "x".to_owned()).err(), Some(FlowError::NotStarted));
    assert_eq!(service.stop(), Err(FlowError::NotStarted));
  }

  #[test]
  fn start_twice_fails() {
    let (service, scheduler) = started();
    assert_eq!(service.start_with(scheduler.shared()), Err(FlowError::AlreadyStarted));
    assert!(service.is_running());
  }

  #[test]
  fn publish_reaches_named_subscribers() {
    let (service, scheduler) = started();
    let orders = Recorder::new(10);
    let audit = Recorder::new(10);
    service.subscribe("orders", orders.clone()).unwrap();
    service.subscribe("audit", audit.clone()).unwrap();

    let done = MutArc::own(vec![]);
    let c_done = done.clone();
    service.publish("orders", "o1".to_owned(), move |_, err| c_done.rc_deref_mut().push(err));
    scheduler.run_tasks();

    assert_eq!(orders.nexts(), vec!["o1".to_owned()]);
    assert!(audit.nexts().is_empty());
    assert_eq!(*done.rc_deref_mut(), vec![None]);
    assert_eq!(service.stream_names(), vec!["audit".to_owned(), "orders".to_owned()]);
    assert_eq!(service.subscriber_count("orders"), 1);
    assert_eq!(service.subscriber_count("missing"), 0);
  }

  #[test]
  fn publish_without_subscribers_reports_stream() {
    let (service, _scheduler) = started();
    let done = MutArc::own(vec![]);
    let c_done = done.clone();
    service.publish("empty", "x".to_owned(), move |_, err| c_done.rc_deref_mut().push(err));
    assert_eq!(
      *done.rc_deref_mut(),
      vec![Some(FlowError::NoActiveSubscriptions { stream: "empty".into() })]
    );
  }

  #[test]
  fn close_stream_completes_subscribers() {
    let (service, scheduler) = started();
    let recorder = Recorder::new(1);
    service.subscribe("s", recorder.clone()).unwrap();
    assert!(service.close_stream("s"));
    assert!(!service.close_stream("s"));
    scheduler.run_tasks();
    assert_eq!(recorder.events(), vec![Event::Subscribed, Event::Complete]);
    assert!(service.stream_names().is_empty());
  }

  #[test]
  fn consumer_attach_conflicts() {
    let (service, _scheduler) = started();
    service.attach_consumer("in", |item: Item<String>| item.processed()).unwrap();
    assert_eq!(
      service.attach_consumer("in", |item: Item<String>| item.processed()),
      Err(FlowError::ConsumerAlreadyAttached { stream: "in".into() })
    );
    assert!(service.detach_consumer("in"));
    assert!(!service.detach_consumer("in"));
  }

  #[test]
  fn send_without_consumer_fails_item() {
    let (service, _scheduler) = started();
    let (item, outcome) = tracked("x".to_owned());
    service.send("nobody", item);
    assert_eq!(
      outcome.take(),
      vec![(Some("x".to_owned()), Some(FlowError::NoConsumerAttached { stream: "nobody".into() }))]
    );
  }

  #[test]
  fn send_reaches_consumer() {
    let (service, _scheduler) = started();
    let seen = MutArc::own(vec![]);
    let c_seen = seen.clone();
    service
      .attach_consumer("in", move |item: Item<String>| {
        c_seen.rc_deref_mut().push(item.payload().clone());
        item.processed();
      })
      .unwrap();
    let (item, outcome) = tracked("hello".to_owned());
    service.send("in", item);
    assert_eq!(*seen.rc_deref_mut(), vec!["hello".to_owned()]);
    assert_eq!(outcome.take(), vec![(Some("hello".to_owned()), None)]);
  }

  #[test]
  fn reply_carries_rewritten_payload() {
    let (service, scheduler) = started();
    service
      .attach_consumer("upper", |mut item: Item<String>| {
        *item.payload_mut() = item.payload().to_uppercase();
        item.processed();
      })
      .unwrap();
    let reply = service.request_reply("upper", "abc".to_owned()).unwrap();
    let recorder = Recorder::new(1);
    reply.subscribe(recorder.clone());
    scheduler.run_tasks();
    assert_eq!(
      recorder.events(),
      vec![Event::Subscribed, Event::Next("ABC".to_owned()), Event::Complete]
    );
  }

  #[test]
  fn reply_errors_are_forwarded() {
    let (service, scheduler) = started();
    service
      .attach_consumer("fail", |item: Item<String>| item.fail(FlowError::application("nope")))
      .unwrap();
    service
      .attach_consumer("empty", |item: Item<String>| {
        let (_payload, completion) = item.into_parts();
        completion.succeed();
      })
      .unwrap();
    service.attach_consumer("drop", |item: Item<String>| drop(item.into_parts())).unwrap();

    for (name, expected) in [
      ("fail", FlowError::application("nope")),
      ("empty", FlowError::EmptyReply),
      ("drop", FlowError::Dropped),
    ] {
      let reply = service.request_reply(name, "q".to_owned()).unwrap();
      let recorder = Recorder::new(1);
      reply.subscribe(recorder.clone());
      scheduler.run_tasks();
      assert_eq!(recorder.events(), vec![Event::Subscribed, Event::Error(expected)]);
    }

    assert_eq!(
      service.request_reply("missing", "q".to_owned()).err(),
      Some(FlowError::NoConsumerAttached { stream: "missing".into() })
    );
  }

  #[test]
  fn stop_closes_streams_and_rejects_work() {
    let (service, scheduler) = started();
    let recorder = Recorder::new(1);
    service.subscribe("s", recorder.clone()).unwrap();
    assert_eq!(
      service.stop(),
      Err(FlowError::ShutdownTimeout { grace: Duration::from_millis(20), in_flight: 1 })
    );
    scheduler.run_tasks();
    // The completion task was skipped after the grace period.
    assert_eq!(recorder.events(), vec![Event::Subscribed]);
    assert!(!service.is_running());
    assert!(service.stream_names().is_empty());
  }

  #[test]
  fn timed_out_stop_resolves_buffered_items() {
    let (service, scheduler) = started();
    let recorder = Recorder::new(0);
    let subscription = service.subscribe("s", recorder.clone()).unwrap();
    let mut outcomes = vec![];
    for payload in ["a", "b"] {
      let (item, outcome) = tracked(payload.to_owned());
      let (payload, completion) = item.into_parts();
      service.publish("s", payload, move |item, err| completion.resolve(item, err));
      outcomes.push(outcome);
    }
    recorder.request(1);

    assert_eq!(
      service.stop(),
      Err(FlowError::ShutdownTimeout { grace: Duration::from_millis(20), in_flight: 1 })
    );
    scheduler.run_tasks();

    assert_eq!(outcomes[0].take(), vec![(Some("a".to_owned()), Some(FlowError::Rejected))]);
    assert_eq!(outcomes[1].take(), vec![(Some("b".to_owned()), Some(FlowError::Rejected))]);
    assert!(subscription.is_closed());
    recorder.request(5);
    scheduler.run_tasks();
    assert_eq!(recorder.events(), vec![Event::Subscribed]);
  }

  #[test]
  fn service_can_restart() {
    let (service, scheduler) = started();
    service.subscribe("s", Recorder::new(0)).unwrap();
    scheduler.run_tasks();
    assert_eq!(service.stop(), Ok(()));
    assert_eq!(service.stop(), Err(FlowError::NotStarted));
    service.start_with(scheduler.shared()).unwrap();
    assert!(service.is_running());
    assert!(service.stream_names().is_empty());
  }
}
