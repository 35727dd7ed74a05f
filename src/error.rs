//! Error taxonomy shared by publishers, subscriptions and the stream service.
//!
//! None of these errors is raised from `publish`, `request` or `cancel`
//! themselves. They travel either through an item's completion callback
//! (discards, missing subscribers) or through a consumer's `on_error`
//! (protocol violations, panics).

use std::time::Duration;

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
  /// `request(n)` was called with `n <= 0`.
  #[error("illegal demand {requested}: request(n) requires n > 0")]
  IllegalDemand { requested: i64 },

  /// An item was published to a stream nobody is subscribed to.
  #[error("no active subscriptions on stream `{stream}`")]
  NoActiveSubscriptions { stream: String },

  /// The backpressure policy evicted the item.
  #[error("discarded by backpressure policy `{policy}`")]
  DiscardedByPolicy { policy: &'static str },

  /// The item arrived after the subscription started completing.
  #[error("subscription closed")]
  SubscriptionClosed,

  /// The subscription was cancelled while the item was still buffered.
  #[error("subscription cancelled")]
  SubscriptionCancelled,

  /// `set_data`/`set_exception` was called on an already finalized mono publisher.
  #[error("mono publisher already finalized")]
  AlreadyFinalized,

  /// A consumer panicked inside `on_next`.
  #[error("consumer panicked: {message}")]
  ConsumerPanicked { message: String },

  /// The backpressure policy panicked.
  #[error("backpressure policy `{policy}` panicked: {message}")]
  PolicyPanicked { policy: &'static str, message: String },

  /// A completion was dropped without being resolved.
  #[error("item dropped before it was processed")]
  Dropped,

  /// A reply completion resolved with neither a payload nor an error.
  #[error("reply completed without a payload")]
  EmptyReply,

  /// No pipeline consumer is attached to the stream.
  #[error("no consumer attached to stream `{stream}`")]
  NoConsumerAttached { stream: String },

  /// A pipeline consumer is already attached to the stream.
  #[error("a consumer is already attached to stream `{stream}`")]
  ConsumerAlreadyAttached { stream: String },

  #[error("stream service is not started")]
  NotStarted,

  #[error("stream service is already started")]
  AlreadyStarted,

  /// The worker pool no longer accepts tasks.
  #[error("worker pool rejected the task: shutting down")]
  Rejected,

  /// The worker pool could not be built or failed to spawn a task.
  #[error("worker pool failure: {message}")]
  WorkerPool { message: String },

  /// Shutdown grace period elapsed with tasks still running.
  #[error("shutdown grace {grace:?} exceeded with {in_flight} task(s) in flight")]
  ShutdownTimeout { grace: Duration, in_flight: usize },

  /// Failure reported by application code processing an item.
  #[error("{message}")]
  Application { message: String },
}

impl FlowError {
  /// Builds an [`FlowError::Application`] error.
  pub fn application(message: impl Into<String>) -> Self {
    FlowError::Application { message: message.into() }
  }

  /// Returns a short stable label (snake_case) for use in logs.
  ///
  /// ```
  /// use rxflow::FlowError;
  ///
  /// let err = FlowError::IllegalDemand { requested: 0 };
  /// assert_eq!(err.as_label(), "illegal_demand");
  /// ```
  pub fn as_label(&self) -> &'static str {
    match self {
      FlowError::IllegalDemand { .. } => "illegal_demand",
      FlowError::NoActiveSubscriptions { .. } => "no_active_subscriptions",
      FlowError::DiscardedByPolicy { .. } => "discarded_by_policy",
      FlowError::SubscriptionClosed => "subscription_closed",
      FlowError::SubscriptionCancelled => "subscription_cancelled",
      FlowError::AlreadyFinalized => "already_finalized",
      FlowError::ConsumerPanicked { .. } => "consumer_panicked",
      FlowError::PolicyPanicked { .. } => "policy_panicked",
      FlowError::Dropped => "dropped",
      FlowError::EmptyReply => "empty_reply",
      FlowError::NoConsumerAttached { .. } => "no_consumer_attached",
      FlowError::ConsumerAlreadyAttached { .. } => "consumer_already_attached",
      FlowError::NotStarted => "not_started",
      FlowError::AlreadyStarted => "already_started",
      FlowError::Rejected => "rejected",
      FlowError::WorkerPool { .. } => "worker_pool",
      FlowError::ShutdownTimeout { .. } => "shutdown_timeout",
      FlowError::Application { .. } => "application",
    }
  }

  /// Whether the error reports an item dropped by the bridge rather than a
  /// failure of the consumer or the application.
  pub fn is_discard(&self) -> bool {
    matches!(
      self,
      FlowError::DiscardedByPolicy { .. }
        | FlowError::SubscriptionClosed
        | FlowError::SubscriptionCancelled
        | FlowError::NoActiveSubscriptions { .. }
        | FlowError::Dropped
    )
  }

  pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
      (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
      message.clone()
    } else {
      "non-string panic payload".to_owned()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn labels_are_stable() {
    assert_eq!(FlowError::SubscriptionCancelled.as_label(), "subscription_cancelled");
    assert_eq!(
      FlowError::ShutdownTimeout { grace: Duration::from_secs(1), in_flight: 2 }.as_label(),
      "shutdown_timeout"
    );
  }

  #[test]
  fn display_carries_context() {
    let err = FlowError::NoActiveSubscriptions { stream: "orders".into() };
    assert_eq!(err.to_string(), "no active subscriptions on stream `orders`");
    assert!(err.is_discard());
    assert!(!FlowError::application("boom").is_discard());
  }

  #[test]
  fn panic_payload_message() {
    let payload: Box<dyn std::any::Any + Send> = Box::new("bad consumer");
    assert_eq!(FlowError::from_panic(payload.as_ref()), "bad consumer");
    let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
    assert_eq!(FlowError::from_panic(payload.as_ref()), "owned");
    let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
    assert_eq!(FlowError::from_panic(payload.as_ref()), "non-string panic payload");
  }
}
