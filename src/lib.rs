//! # rxflow: backpressure-aware publish/subscribe
//!
//! Bridges a push-based stream of items to consumers that pull with explicit
//! demand.
//!
//! ## Quick Start
//!
//! ```rust
//! use rxflow::prelude::*;
//!
//! let scheduler = ManualScheduler::new();
//! let publisher = Publisher::<u32>::new("numbers", scheduler.shared());
//! publisher.subscribe(ForEach::new(|v: u32| println!("Value: {}", v)));
//!
//! publisher.publish_with(1, |_, err| assert!(err.is_none()));
//! scheduler.run_tasks();
//! ```
//!
//! ## Key Concepts
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Publisher`] | Named multicast stream, fans every item out to its subscriptions |
//! | [`StreamSubscription`] | Per-consumer buffer and demand counter |
//! | [`MonoPublisher`] | Single value or error, for request/reply |
//! | [`StreamService`] | Registry of named streams sharing one worker pool |
//! | [`Scheduler`] | Worker pool running every consumer callback |
//!
//! ## Feature Flags
//!
//! - **`futures-scheduler`** (default): `futures` thread pool scheduler and
//!   [`StreamService::start`]
//! - **`tokio-scheduler`**: runs deliveries on a tokio blocking pool
//!
//! [`Publisher`]: publisher::Publisher
//! [`StreamSubscription`]: subscription::StreamSubscription
//! [`MonoPublisher`]: mono::MonoPublisher
//! [`StreamService`]: service::StreamService
//! [`StreamService::start`]: service::StreamService::start
//! [`Scheduler`]: scheduler::Scheduler

pub mod backpressure;
pub mod config;
pub mod error;
pub mod item;
pub mod mono;
pub mod prelude;
pub mod publisher;
pub mod rc;
pub mod scheduler;
pub mod service;
pub mod stream;
pub mod subscriber;
pub mod subscription;

#[cfg(test)]
mod test_util;

pub use crate::{
  config::{PolicyConfig, ServiceConfig},
  error::FlowError,
};

#[cfg(doctest)]
mod __markdown_doctests {
  mod readme {
    #![doc = include_str!("../README.md")]
  }
}
