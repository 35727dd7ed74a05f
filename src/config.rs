//! # Stream service configuration.
//!
//! [`ServiceConfig`] sizes the worker pool, bounds the shutdown wait and
//! picks the backpressure policy of every publisher the service creates.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use rxflow::{PolicyConfig, ServiceConfig};
//!
//! let mut cfg = ServiceConfig::default();
//! cfg.worker_threads = 4;
//! cfg.shutdown_grace = Duration::from_secs(1);
//! cfg.policy = PolicyConfig::DropNewest(64);
//!
//! assert_eq!(cfg.worker_threads, 4);
//! ```

use std::{sync::Arc, time::Duration};

use crate::backpressure::{BackpressurePolicy, DropNewest, DropOldest, Unbounded};

/// Built-in backpressure policies selectable from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyConfig {
  Unbounded,
  /// Keep at most `n` items, evicting the oldest.
  DropOldest(usize),
  /// Keep at most `n` items, rejecting new ones while full.
  DropNewest(usize),
}

impl Default for PolicyConfig {
  fn default() -> Self { PolicyConfig::DropOldest(1024) }
}

impl PolicyConfig {
  pub fn build<T>(&self) -> Arc<dyn BackpressurePolicy<T>> {
    match *self {
      PolicyConfig::Unbounded => Arc::new(Unbounded),
      PolicyConfig::DropOldest(capacity) => Arc::new(DropOldest::new(capacity)),
      PolicyConfig::DropNewest(capacity) => Arc::new(DropNewest::new(capacity)),
    }
  }
}

/// Configuration of a [`StreamService`](crate::service::StreamService).
///
/// ## Field semantics
/// - `worker_threads`: pool size (`0` = one thread per CPU)
/// - `thread_name_prefix`: prefix of worker thread names
/// - `shutdown_grace`: how long `stop` waits for in-flight deliveries
/// - `policy`: backpressure policy of every publisher the service creates
#[derive(Clone, Debug)]
pub struct ServiceConfig {
  pub worker_threads: usize,
  pub thread_name_prefix: String,
  pub shutdown_grace: Duration,
  pub policy: PolicyConfig,
}

impl Default for ServiceConfig {
  /// - `worker_threads = 0` (one per CPU)
  /// - `thread_name_prefix = "rxflow-worker-"`
  /// - `shutdown_grace = 5s`
  /// - `policy = PolicyConfig::DropOldest(1024)`
  fn default() -> Self {
    Self {
      worker_threads: 0,
      thread_name_prefix: "rxflow-worker-".to_owned(),
      shutdown_grace: Duration::from_secs(5),
      policy: PolicyConfig::default(),
    }
  }
}
