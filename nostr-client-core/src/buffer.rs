//! A small bounded async queue with a configurable overflow policy.
//!
//! The spec calls for two different backpressure policies over otherwise
//! identical bounded buffers (§4.D "drop-oldest" inbound connection
//! frames, §5 "drop-newest" manager-level event streams); rather than
//! duplicate the plumbing, both are expressed as one ring buffer whose
//! behavior on overflow is a constructor argument.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
  /// Evict the oldest buffered item to make room for the new one.
  DropOldest,
  /// Discard the incoming item, keeping everything already buffered.
  DropNewest,
}

struct Inner<T> {
  items: Mutex<VecDeque<T>>,
  notify: Notify,
  capacity: usize,
  policy: OverflowPolicy,
  dropped: AtomicU64,
  closed: AtomicBool,
}

/// A cloneable handle; clones share the same underlying queue.
pub struct BoundedQueue<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for BoundedQueue<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> BoundedQueue<T> {
  pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
    Self {
      inner: Arc::new(Inner {
        items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        notify: Notify::new(),
        capacity,
        policy,
        dropped: AtomicU64::new(0),
        closed: AtomicBool::new(false),
      }),
    }
  }

  /// Pushes an item, applying the overflow policy if the queue is full.
  /// Returns `true` if the item was kept (queued or replaced an evicted
  /// item), `false` if it was the one discarded under `DropNewest`.
  pub async fn push(&self, item: T) -> bool {
    let mut items = self.inner.items.lock().await;
    if items.len() >= self.inner.capacity {
      match self.inner.policy {
        OverflowPolicy::DropOldest => {
          items.pop_front();
          self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        OverflowPolicy::DropNewest => {
          self.inner.dropped.fetch_add(1, Ordering::Relaxed);
          return false;
        }
      }
    }
    items.push_back(item);
    drop(items);
    self.inner.notify.notify_one();
    true
  }

  /// Waits for and removes the next item, or returns `None` once `close`
  /// has been called and the queue has drained.
  pub async fn pop(&self) -> Option<T> {
    loop {
      {
        let mut items = self.inner.items.lock().await;
        if let Some(item) = items.pop_front() {
          return Some(item);
        }
        if self.is_closed() {
          return None;
        }
      }
      self.inner.notify.notified().await;
      if self.is_closed() {
        let mut items = self.inner.items.lock().await;
        if let Some(item) = items.pop_front() {
          return Some(item);
        }
        return None;
      }
    }
  }

  pub fn dropped_count(&self) -> u64 {
    self.inner.dropped.load(Ordering::Relaxed)
  }

  pub fn close(&self) {
    self.inner.closed.store(true, Ordering::SeqCst);
    self.inner.notify.notify_waiters();
  }

  fn is_closed(&self) -> bool {
    self.inner.closed.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[tokio::test]
  async fn drop_oldest_evicts_the_earliest_item() {
    let queue: BoundedQueue<i32> = BoundedQueue::new(2, OverflowPolicy::DropOldest);
    queue.push(1).await;
    queue.push(2).await;
    queue.push(3).await;
    assert_eq!(queue.dropped_count(), 1);
    assert_eq!(queue.pop().await, Some(2));
    assert_eq!(queue.pop().await, Some(3));
  }

  #[tokio::test]
  async fn drop_newest_discards_the_incoming_item() {
    let queue: BoundedQueue<i32> = BoundedQueue::new(2, OverflowPolicy::DropNewest);
    queue.push(1).await;
    queue.push(2).await;
    let kept = queue.push(3).await;
    assert!(!kept);
    assert_eq!(queue.dropped_count(), 1);
    assert_eq!(queue.pop().await, Some(1));
    assert_eq!(queue.pop().await, Some(2));
  }
}
