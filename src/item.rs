//! Items flowing through the bridge and their completion callbacks.
//!
//! An [`Item`] pairs an application payload with a [`Completion`]. Whoever is
//! last responsible for the item's fate resolves the completion: the
//! subscription after delivering it, the publisher when nobody listens, a
//! backpressure discard, or a pipeline consumer answering a request.

use std::fmt::{Debug, Formatter};

use crate::error::FlowError;

/// Callback invoked once an item has been processed.
///
/// The first argument hands the payload back when the resolving component
/// still owns it (discards, replies). It is `None` once the payload has been
/// moved into a consumer. The second argument is `None` on success.
pub type OnProcessed<T> = Box<dyn FnOnce(Option<T>, Option<FlowError>) + Send + 'static>;

/// One-shot wrapper around an [`OnProcessed`] callback.
///
/// Dropping an unresolved completion fires the callback with
/// [`FlowError::Dropped`], so an armed callback fires exactly once.
pub struct Completion<T> {
  callback: Option<OnProcessed<T>>,
}

impl<T> Completion<T> {
  pub fn new<F>(callback: F) -> Self
  where
    F: FnOnce(Option<T>, Option<FlowError>) + Send + 'static,
  {
    Self { callback: Some(Box::new(callback)) }
  }

  /// A completion nobody listens to.
  pub fn none() -> Self { Self { callback: None } }

  #[inline]
  pub fn is_armed(&self) -> bool { self.callback.is_some() }

  pub fn resolve(mut self, item: Option<T>, error: Option<FlowError>) {
    if let Some(callback) = self.callback.take() {
      callback(item, error);
    }
  }

  #[inline]
  pub fn succeed(self) { self.resolve(None, None) }

  #[inline]
  pub fn fail(self, item: Option<T>, error: FlowError) { self.resolve(item, Some(error)) }
}

impl<T> Drop for Completion<T> {
  fn drop(&mut self) {
    if let Some(callback) = self.callback.take() {
      callback(None, Some(FlowError::Dropped));
    }
  }
}

impl<T> Default for Completion<T> {
  fn default() -> Self { Self::none() }
}

impl<T> Debug for Completion<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Completion").field("armed", &self.is_armed()).finish()
  }
}

/// An application payload together with its completion.
pub struct Item<T> {
  payload: T,
  completion: Completion<T>,
}

impl<T> Item<T> {
  /// An item without a completion callback.
  pub fn new(payload: T) -> Self { Self { payload, completion: Completion::none() } }

  pub fn with_completion<F>(payload: T, on_processed: F) -> Self
  where
    F: FnOnce(Option<T>, Option<FlowError>) + Send + 'static,
  {
    Self { payload, completion: Completion::new(on_processed) }
  }

  pub fn from_parts(payload: T, completion: Completion<T>) -> Self { Self { payload, completion } }

  #[inline]
  pub fn payload(&self) -> &T { &self.payload }

  #[inline]
  pub fn payload_mut(&mut self) -> &mut T { &mut self.payload }

  pub fn into_parts(self) -> (T, Completion<T>) { (self.payload, self.completion) }

  /// Reports success and hands the (possibly rewritten) payload back to the
  /// callback. Used by pipeline consumers to answer a request.
  pub fn processed(self) {
    let (payload, completion) = self.into_parts();
    completion.resolve(Some(payload), None);
  }

  /// Reports a failure, handing the payload back.
  pub fn fail(self, error: FlowError) {
    let (payload, completion) = self.into_parts();
    completion.fail(Some(payload), error);
  }
}

impl<T: Debug> Debug for Item<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Item")
      .field("payload", &self.payload)
      .field("completion", &self.completion)
      .finish()
  }
}
