//! Buffer eviction policies.
//!
//! A [`BackpressurePolicy`] decides what a subscription keeps when a new item
//! arrives. It runs while the subscription's state lock is held, so it must
//! be fast, must not block and must not call back into the subscription.
//! It never resolves item completions itself: everything it evicts is
//! returned and the subscription reports the discard after releasing its
//! lock.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::item::Item;

/// Pending items of one subscription, oldest first.
pub type Buffer<T> = VecDeque<Item<T>>;

/// Items evicted by one policy decision.
pub type Evicted<T> = SmallVec<[Item<T>; 1]>;

pub trait BackpressurePolicy<T>: Send + Sync {
  /// Admits `item` into `buffer`, returning everything evicted, possibly
  /// including `item` itself.
  fn apply(&self, buffer: &mut Buffer<T>, item: Item<T>) -> Evicted<T>;

  /// Name reported in discard errors and logs.
  fn name(&self) -> &'static str;
}

/// Keeps every item. Memory grows with the consumer's lag.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unbounded;

impl<T> BackpressurePolicy<T> for Unbounded {
  fn apply(&self, buffer: &mut Buffer<T>, item: Item<T>) -> Evicted<T> {
    buffer.push_back(item);
    Evicted::new()
  }

  fn name(&self) -> &'static str { "unbounded" }
}

/// Bounded buffer that evicts its oldest items to make room.
#[derive(Clone, Copy, Debug)]
pub struct DropOldest {
  capacity: usize,
}

impl DropOldest {
  /// `capacity` is clamped to at least one item.
  pub fn new(capacity: usize) -> Self { Self { capacity: capacity.max(1) } }

  pub fn capacity(&self) -> usize { self.capacity }
}

impl<T> BackpressurePolicy<T> for DropOldest {
  fn apply(&self, buffer: &mut Buffer<T>, item: Item<T>) -> Evicted<T> {
    buffer.push_back(item);
    let mut evicted = Evicted::new();
    while buffer.len() > self.capacity {
      if let Some(oldest) = buffer.pop_front() {
        evicted.push(oldest);
      }
    }
    evicted
  }

  fn name(&self) -> &'static str { "drop_oldest" }
}

/// Bounded buffer that rejects new items while full.
#[derive(Clone, Copy, Debug)]
pub struct DropNewest {
  capacity: usize,
}

impl DropNewest {
  /// `capacity` is clamped to at least one item.
  pub fn new(capacity: usize) -> Self { Self { capacity: capacity.max(1) } }

  pub fn capacity(&self) -> usize { self.capacity }
}

impl<T> BackpressurePolicy<T> for DropNewest {
  fn apply(&self, buffer: &mut Buffer<T>, item: Item<T>) -> Evicted<T> {
    let mut evicted = Evicted::new();
    if buffer.len() >= self.capacity {
      evicted.push(item);
    } else {
      buffer.push_back(item);
    }
    evicted
  }

  fn name(&self) -> &'static str { "drop_newest" }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn payloads(buffer: &Buffer<i32>) -> Vec<i32> { buffer.iter().map(|i| *i.payload()).collect() }

  #[test]
  fn unbounded_keeps_everything() {
    let mut buffer = Buffer::new();
    for i in 0..100 {
      assert!(Unbounded.apply(&mut buffer, Item::new(i)).is_empty());
    }
    assert_eq!(buffer.len(), 100);
  }

  #[test]
  fn drop_oldest_evicts_front() {
    let policy = DropOldest::new(2);
    let mut buffer = Buffer::new();
    policy.apply(&mut buffer, Item::new(1));
    policy.apply(&mut buffer, Item::new(2));
    let evicted = policy.apply(&mut buffer, Item::new(3));
    assert_eq!(evicted.iter().map(|i| *i.payload()).collect::<Vec<_>>(), vec![1]);
    assert_eq!(payloads(&buffer), vec![2, 3]);
  }

  #[test]
  fn drop_newest_rejects_incoming() {
    let policy = DropNewest::new(1);
    let mut buffer = Buffer::new();
    assert!(policy.apply(&mut buffer, Item::new(1)).is_empty());
    let evicted = policy.apply(&mut buffer, Item::new(2));
    assert_eq!(evicted.iter().map(|i| *i.payload()).collect::<Vec<_>>(), vec![2]);
    assert_eq!(payloads(&buffer), vec![1]);
  }

  #[test]
  fn zero_capacity_is_clamped() {
    assert_eq!(DropOldest::new(0).capacity(), 1);
    assert_eq!(DropNewest::new(0).capacity(), 1);
  }
}
