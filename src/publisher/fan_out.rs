use std::sync::{Arc, Mutex};

use crate::{error::FlowError, item::Completion, rc::RcDerefMut};

/// Aggregates the per-subscription completions of one fanned-out item into
/// the publisher's single completion.
///
/// The aggregate fires once every share has reported, with the first error
/// any share reported and the first payload any share handed back.
pub(crate) struct FanOutTracker<T> {
  state: Mutex<FanOutState<T>>,
}

struct FanOutState<T> {
  remaining: usize,
  first_error: Option<FlowError>,
  returned: Option<T>,
  completion: Option<Completion<T>>,
}

impl<T: Send + 'static> FanOutTracker<T> {
  /// Splits `completion` into `width` shares.
  ///
  /// An unarmed completion yields unarmed shares and a width of one hands the
  /// completion through untouched.
  pub(crate) fn split(completion: Completion<T>, width: usize) -> Vec<Completion<T>> {
    if !completion.is_armed() {
      return (0..width).map(|_| Completion::none()).collect();
    }
    if width == 1 {
      return vec![completion];
    }

    let tracker = Arc::new(FanOutTracker {
      state: Mutex::new(FanOutState {
        remaining: width,
        first_error: None,
        returned: None,
        completion: Some(completion),
      }),
    });
    (0..width)
      .map(|_| {
        let tracker = tracker.clone();
        Completion::new(move |item, error| tracker.report_outcome(item, error))
      })
      .collect()
  }

  pub(crate) fn report_outcome(&self, item: Option<T>, error: Option<FlowError>) {
    let done = {
      let mut state = self.state.rc_deref_mut();
      state.remaining = state.remaining.saturating_sub(1);
      if state.first_error.is_none() {
        state.first_error = error;
      }
      if state.returned.is_none() {
        state.returned = item;
      }
      if state.remaining == 0 {
        let returned = state.returned.take();
        let error = state.first_error.take();
        state.completion.take().map(|completion| (completion, returned, error))
      } else {
        None
      }
    };

    if let Some((completion, item, error)) = done {
      completion.resolve(item, error);
    }
  }
}
