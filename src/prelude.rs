//! Prelude module for convenient imports
//!
//! This module re-exports commonly used types and traits for easy access.

pub use crate::{
  backpressure::{BackpressurePolicy, DropNewest, DropOldest, Unbounded},
  config::{PolicyConfig, ServiceConfig},
  error::FlowError,
  item::{Completion, Item, OnProcessed},
  mono::{MonoFuture, MonoPublisher, MonoSubscription},
  publisher::Publisher,
  service::{StreamConsumer, StreamService},
  stream::SubscriptionStream,
  subscriber::{ForEach, Subscriber, Subscription, SubscriptionHandle},
  subscription::{Lifecycle, StreamSubscription, SubscriptionId},
};
// Schedulers
#[cfg(feature = "futures-scheduler")]
pub use crate::scheduler::new_thread_pool;
#[cfg(feature = "tokio-scheduler")]
pub use crate::scheduler::TokioScheduler;
pub use crate::scheduler::{ManualScheduler, Scheduler, SharedScheduler, WorkerPool};
