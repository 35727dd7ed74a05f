//! Shared mutable cells.
//!
//! Every lock in the crate guards a short state transition, so a poisoned
//! lock only means some unrelated callback panicked while a guard was alive.
//! The guarded state is still consistent and access simply proceeds.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub trait RcDerefMut {
  type Target<'a>
  where
    Self: 'a;
  #[allow(clippy::needless_lifetimes)]
  fn rc_deref_mut<'a>(&'a self) -> Self::Target<'a>;
}

impl<T> RcDerefMut for Mutex<T> {
  type Target<'a>
    = MutexGuard<'a, T>
  where
    Self: 'a;

  #[inline]
  #[allow(clippy::needless_lifetimes)]
  fn rc_deref_mut<'a>(&'a self) -> Self::Target<'a> {
    self.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// A cloneable `Arc<Mutex<T>>`.
#[derive(Default)]
pub struct MutArc<T>(Arc<Mutex<T>>);

impl<T> MutArc<T> {
  pub fn own(t: T) -> Self { Self(Arc::new(Mutex::new(t))) }
}

impl<T> RcDerefMut for MutArc<T> {
  type Target<'a>
    = MutexGuard<'a, T>
  where
    Self: 'a;

  #[inline]
  #[allow(clippy::needless_lifetimes)]
  fn rc_deref_mut<'a>(&'a self) -> Self::Target<'a> { self.0.rc_deref_mut() }
}

impl<T> Clone for MutArc<T> {
  #[inline]
  fn clone(&self) -> Self { Self(self.0.clone()) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn poisoned_lock_is_recovered() {
    let cell = MutArc::own(1);
    let c_cell = cell.clone();
    let _ = std::thread::spawn(move || {
      let _guard = c_cell.rc_deref_mut();
      panic!("poison");
    })
    .join();
    *cell.rc_deref_mut() += 1;
    assert_eq!(*cell.rc_deref_mut(), 2);
  }
}
