//! `SubscriptionManager` (§4.F): layered above the `RelayPool`, merges
//! eligible subscriptions, deduplicates across every managed
//! subscription, writes through to the `EventCache`, and handles
//! auto-renewal / inactivity GC / one-shot queries.
//!
//! Grounded in the teacher's `client/src/pool.rs` subscription bookkeeping
//! (`RelayPool::add_subscription_to_pool`), generalized from a single
//! always-replayed registry into a merge-aware, refcounted layer above
//! the new multi-relay `RelayPool`.

mod merge;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use nostr_proto::{Event, Filter};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::cache::EventCache;
use crate::config::{SubscriptionOptions, DEDUP_SET_CAPACITY, ONE_SHOT_QUERY_TIMEOUT};
use crate::pool::{PoolSubscriptionEvent, RelayPool};

pub use merge::mergeable;

/// What a `ManagedSubscription` delivers to its owner.
#[derive(Debug, Clone)]
pub enum ManagedEvent {
  Event(Box<Event>),
  Eose,
  Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct ManagedSubscriptionStats {
  pub created_at: Instant,
  pub last_activity: Instant,
  pub event_count: u64,
  pub eose: bool,
}

struct SubStats {
  created_at: Instant,
  last_activity: StdMutex<Instant>,
  event_count: AtomicU64,
  eose: AtomicBool,
}

impl SubStats {
  fn new() -> Arc<Self> {
    let now = Instant::now();
    Arc::new(Self {
      created_at: now,
      last_activity: StdMutex::new(now),
      event_count: AtomicU64::new(0),
      eose: AtomicBool::new(false),
    })
  }

  fn touch(&self) {
    *self.last_activity.lock().expect("last_activity mutex poisoned") = Instant::now();
  }

  fn snapshot(&self) -> ManagedSubscriptionStats {
    ManagedSubscriptionStats {
      created_at: self.created_at,
      last_activity: *self.last_activity.lock().expect("last_activity mutex poisoned"),
      event_count: self.event_count.load(Ordering::Relaxed),
      eose: self.eose.load(Ordering::Relaxed),
    }
  }
}

struct Output {
  sender: mpsc::UnboundedSender<ManagedEvent>,
  options: SubscriptionOptions,
  stats: Arc<SubStats>,
}

/// One underlying `PoolSubscription` shared by every managed subscription
/// merged onto it (§4.F "virtual subscription").
struct Group {
  pool_sub_id: String,
  filters: Vec<Filter>,
  outputs: Mutex<HashMap<String, Output>>,
}

pub struct SubscriptionManager {
  pool: Arc<RelayPool>,
  cache: Option<Arc<EventCache>>,
  groups: Mutex<HashMap<String, Arc<Group>>>,
  seen_ids: Mutex<HashSet<String>>,
}

impl SubscriptionManager {
  pub fn new(pool: Arc<RelayPool>, cache: Option<Arc<EventCache>>) -> Arc<Self> {
    Arc::new(Self {
      pool,
      cache,
      groups: Mutex::new(HashMap::new()),
      seen_ids: Mutex::new(HashSet::new()),
    })
  }

  /// Merges onto a compatible existing subscription when one exists,
  /// otherwise issues a new `PoolSubscription` (§4.F steps 1-2).
  pub async fn subscribe(
    self: &Arc<Self>,
    filters: Vec<Filter>,
    options: SubscriptionOptions,
  ) -> crate::Result<ManagedSubscription> {
    let managed_id = Uuid::new_v4().to_string();
    let stats = SubStats::new();
    let (sender, receiver) = mpsc::unbounded_channel();

    let existing_group = {
      let groups = self.groups.lock().await;
      groups.values().find(|g| mergeable(&g.filters, &filters)).cloned()
    };

    let group = if let Some(group) = existing_group {
      group
        .outputs
        .lock()
        .await
        .insert(managed_id.clone(), Output { sender, options: options.clone(), stats: Arc::clone(&stats) });
      group
    } else {
      let pool_sub = self.pool.subscribe(filters.clone(), None).await?;
      let pool_sub_id = pool_sub.id().to_string();
      let group = Arc::new(Group {
        pool_sub_id: pool_sub_id.clone(),
        filters: filters.clone(),
        outputs: Mutex::new(HashMap::new()),
      });
      group
        .outputs
        .lock()
        .await
        .insert(managed_id.clone(), Output { sender, options: options.clone(), stats: Arc::clone(&stats) });
      self.groups.lock().await.insert(pool_sub_id, Arc::clone(&group));
      self.spawn_dispatcher(pool_sub, Arc::clone(&group));
      group
    };

    if let Some(timeout) = options.inactivity_timeout {
      self.spawn_inactivity_watchdog(managed_id.clone(), group.pool_sub_id.clone(), Arc::clone(&stats), timeout);
    }

    Ok(ManagedSubscription {
      id: managed_id,
      pool_sub_id: group.pool_sub_id.clone(),
      options,
      receiver,
      stats,
      manager: Arc::clone(self),
    })
  }

  /// Issues a subscription with `close_after_eose = true` and a hard
  /// timeout, returning the full collected sequence (§4.F "one-shot
  /// query").
  pub async fn query_once(self: &Arc<Self>, filters: Vec<Filter>) -> crate::Result<Vec<Event>> {
    let options = SubscriptionOptions {
      auto_renew: false,
      close_after_eose: true,
      ..SubscriptionOptions::default()
    };
    let mut sub = self.subscribe(filters, options).await?;

    let mut events = Vec::new();
    let deadline = tokio::time::sleep(ONE_SHOT_QUERY_TIMEOUT);
    tokio::pin!(deadline);
    loop {
      tokio::select! {
        _ = &mut deadline => break,
        received = sub.recv() => match received {
          Some(ManagedEvent::Event(event)) => events.push(*event),
          Some(ManagedEvent::Eose) | Some(ManagedEvent::Closed) | None => break,
        }
      }
    }
    Ok(events)
  }

  fn spawn_dispatcher(self: &Arc<Self>, mut pool_sub: crate::pool::PoolSubscription, group: Arc<Group>) {
    let manager = Arc::clone(self);
    tokio::spawn(async move {
      loop {
        match pool_sub.recv().await {
          Some(PoolSubscriptionEvent::Event(event)) => manager.handle_event(&group, *event).await,
          Some(PoolSubscriptionEvent::Eose) => manager.handle_eose(&group).await,
          Some(PoolSubscriptionEvent::Closed(_)) | None => {
            if manager.should_renew(&group).await {
              match manager.pool.subscribe(group.filters.clone(), Some(group.pool_sub_id.clone())).await {
                Ok(renewed) => {
                  pool_sub = renewed;
                  continue;
                }
                Err(_) => manager.finish_group(&group).await,
              }
            } else {
              manager.finish_group(&group).await;
            }
            break;
          }
        }
      }
      manager.groups.lock().await.remove(&group.pool_sub_id);
    });
  }

  async fn handle_event(&self, group: &Arc<Group>, event: Event) {
    {
      let mut seen = self.seen_ids.lock().await;
      if seen.len() >= DEDUP_SET_CAPACITY {
        seen.clear();
      }
      if !seen.insert(event.id.clone()) {
        return;
      }
    }

    let outputs = group.outputs.lock().await;
    if outputs.values().any(|o| o.options.cache_results) {
      if let Some(cache) = &self.cache {
        let _ = cache.put(event.clone(), None).await;
      }
    }
    for output in outputs.values() {
      output.stats.event_count.fetch_add(1, Ordering::Relaxed);
      output.stats.touch();
      let _ = output.sender.send(ManagedEvent::Event(Box::new(event.clone())));
    }
  }

  async fn handle_eose(&self, group: &Arc<Group>) {
    let mut to_close = Vec::new();
    let outputs = group.outputs.lock().await;
    for (id, output) in outputs.iter() {
      output.stats.eose.store(true, Ordering::Relaxed);
      let _ = output.sender.send(ManagedEvent::Eose);
      if output.options.close_after_eose {
        to_close.push(id.clone());
      }
    }
    drop(outputs);
    for id in to_close {
      self.close(&id, &group.pool_sub_id).await;
    }
  }

  async fn should_renew(&self, group: &Arc<Group>) -> bool {
    group.outputs.lock().await.values().any(|o| o.options.auto_renew)
  }

  async fn finish_group(&self, group: &Arc<Group>) {
    let outputs = group.outputs.lock().await;
    for output in outputs.values() {
      let _ = output.sender.send(ManagedEvent::Closed);
    }
  }

  /// Drops a managed subscription's output; when a group's last owner
  /// leaves, closes the underlying `PoolSubscription` too.
  pub async fn close(&self, managed_id: &str, pool_sub_id: &str) {
    let group = self.groups.lock().await.get(pool_sub_id).cloned();
    let Some(group) = group else { return };

    let empty = {
      let mut outputs = group.outputs.lock().await;
      outputs.remove(managed_id);
      outputs.is_empty()
    };
    if empty {
      self.pool.close_subscription(pool_sub_id).await;
      self.groups.lock().await.remove(pool_sub_id);
    }
  }

  fn spawn_inactivity_watchdog(
    self: &Arc<Self>,
    managed_id: String,
    pool_sub_id: String,
    stats: Arc<SubStats>,
    timeout: Duration,
  ) {
    let manager = Arc::clone(self);
    tokio::spawn(async move {
      loop {
        tokio::time::sleep(timeout).await;
        let elapsed = stats.last_activity.lock().expect("last_activity mutex poisoned").elapsed();
        if elapsed >= timeout {
          manager.close(&managed_id, &pool_sub_id).await;
          break;
        }
      }
    });
  }
}

/// The caller's handle to a (possibly merged) subscription. Dropping it
/// cancels its renewal task and, once it is the last owner, closes the
/// underlying subscription on every relay (§5 "Cancellation").
pub struct ManagedSubscription {
  pub id: String,
  pool_sub_id: String,
  options: SubscriptionOptions,
  receiver: mpsc::UnboundedReceiver<ManagedEvent>,
  stats: Arc<SubStats>,
  manager: Arc<SubscriptionManager>,
}

impl ManagedSubscription {
  pub async fn recv(&mut self) -> Option<ManagedEvent> {
    self.receiver.recv().await
  }

  pub fn options(&self) -> &SubscriptionOptions {
    &self.options
  }

  pub fn stats(&self) -> ManagedSubscriptionStats {
    self.stats.snapshot()
  }
}

impl Drop for ManagedSubscription {
  fn drop(&mut self) {
    let manager = Arc::clone(&self.manager);
    let id = self.id.clone();
    let pool_sub_id = self.pool_sub_id.clone();
    tokio::spawn(async move {
      manager.close(&id, &pool_sub_id).await;
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;
  use nostr_proto::EventKind;

  #[test]
  fn merge_requires_identical_kinds_and_no_identity_clauses() {
    let a = vec![Filter::new().with_kinds(vec![EventKind::Text])];
    let b = vec![Filter::new().with_kinds(vec![EventKind::Text])];
    assert!(mergeable(&a, &b));

    let with_ids = vec![Filter::new().with_kinds(vec![EventKind::Text]).with_ids(vec![nostr_proto::EventId::new("x")])];
    assert!(!mergeable(&a, &with_ids));
  }

  #[test]
  fn merge_requires_overlapping_time_ranges() {
    let a = vec![Filter::new().with_kinds(vec![EventKind::Text]).with_until(100)];
    let b = vec![Filter::new().with_kinds(vec![EventKind::Text]).with_since(200)];
    assert!(!mergeable(&a, &b));
  }
}
