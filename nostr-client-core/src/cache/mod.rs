//! `EventCache` (§4.C): an LRU-bounded, indexed in-memory store with an
//! optional disk tier. Nothing upstream in this crate keeps its own copy
//! of events; the Pool and SubscriptionManager write through here.
//!
//! Grounded in the teacher's `client/src/db.rs` use of a single on-disk
//! store behind a narrow get/put contract, generalized from one fixed
//! key-value table to an indexed, evictable, many-event store. The disk
//! tier itself does not reuse the teacher's `redb` database: per-event
//! JSON files are a better fit for a content-addressed, independently
//! age-out-able store than a single shared table would be.

mod disk;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nostr_proto::{filter, Event, EventKind, Filter};
use tokio::sync::Mutex;

use crate::config::{CacheConfig, Persistence};
use crate::crypto::Crypto;
use crate::error::{CacheError, Error};

/// An event plus the bookkeeping the cache layers on top of it (§3
/// "CachedEntry").
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
  pub event: Event,
  pub received_at: i64,
  pub source_relays: Vec<String>,
}

struct Indices {
  by_author: HashMap<String, HashSet<String>>,
  by_kind: HashMap<EventKind, HashSet<String>>,
  by_tag: HashMap<String, HashMap<String, HashSet<String>>>,
  time_sorted: BTreeMap<(i64, String), ()>,
}

impl Indices {
  fn new() -> Self {
    Self {
      by_author: HashMap::new(),
      by_kind: HashMap::new(),
      by_tag: HashMap::new(),
      time_sorted: BTreeMap::new(),
    }
  }

  fn insert(&mut self, event: &Event) {
    self.by_author.entry(event.pubkey.clone()).or_default().insert(event.id.clone());
    self.by_kind.entry(event.kind).or_default().insert(event.id.clone());
    for tag in &event.tags {
      if let (Some(name), Some(value)) = (tag.name(), tag.first_value()) {
        self
          .by_tag
          .entry(name.to_string())
          .or_default()
          .entry(value.to_string())
          .or_default()
          .insert(event.id.clone());
      }
    }
    self.time_sorted.insert((event.created_at, event.id.clone()), ());
  }

  fn remove(&mut self, event: &Event) {
    if let Some(ids) = self.by_author.get_mut(&event.pubkey) {
      ids.remove(&event.id);
    }
    if let Some(ids) = self.by_kind.get_mut(&event.kind) {
      ids.remove(&event.id);
    }
    for tag in &event.tags {
      if let (Some(name), Some(value)) = (tag.name(), tag.first_value()) {
        if let Some(values) = self.by_tag.get_mut(name) {
          if let Some(ids) = values.get_mut(value) {
            ids.remove(&event.id);
          }
        }
      }
    }
    self.time_sorted.remove(&(event.created_at, event.id.clone()));
  }

  /// Candidate id set from the cheapest indexable clauses present on the
  /// filter, or `None` if the filter has nothing indexable and a full
  /// scan is required (§4.C "Query plan").
  fn candidates(&self, filter: &Filter) -> Option<HashSet<String>> {
    let mut sets: Vec<HashSet<String>> = Vec::new();

    if let Some(ids) = &filter.ids {
      sets.push(ids.iter().map(|id| id.as_str().to_string()).collect());
    }
    if let Some(authors) = &filter.authors {
      let mut set = HashSet::new();
      for author in authors {
        if let Some(ids) = self.by_author.get(author) {
          set.extend(ids.iter().cloned());
        }
      }
      sets.push(set);
    }
    if let Some(kinds) = &filter.kinds {
      let mut set = HashSet::new();
      for kind in kinds {
        if let Some(ids) = self.by_kind.get(kind) {
          set.extend(ids.iter().cloned());
        }
      }
      sets.push(set);
    }
    for (name, values) in &filter.tags {
      let mut set = HashSet::new();
      if let Some(by_value) = self.by_tag.get(name) {
        for value in values {
          if let Some(ids) = by_value.get(value) {
            set.extend(ids.iter().cloned());
          }
        }
      }
      sets.push(set);
    }

    if sets.is_empty() {
      return None;
    }
    let mut iter = sets.into_iter();
    let mut intersection = iter.next().unwrap();
    for set in iter {
      intersection.retain(|id| set.contains(id));
    }
    Some(intersection)
  }
}

/// In-memory LRU plus optional disk spill, fully serialized on a single
/// async mutex (§4.C "Concurrency": single owner, consistent readers).
pub struct EventCache {
  crypto: Arc<dyn Crypto>,
  config: CacheConfig,
  inner: Mutex<Inner>,
}

struct Inner {
  entries: HashMap<String, CachedEntry>,
  indices: Indices,
  recency: VecDeque<String>,
}

impl EventCache {
  pub fn new(config: CacheConfig, crypto: Arc<dyn Crypto>) -> Self {
    Self {
      crypto,
      config,
      inner: Mutex::new(Inner {
        entries: HashMap::new(),
        indices: Indices::new(),
        recency: VecDeque::new(),
      }),
    }
  }

  fn touch_recency(recency: &mut VecDeque<String>, id: &str) {
    if let Some(pos) = recency.iter().position(|existing| existing == id) {
      recency.remove(pos);
    }
    recency.push_back(id.to_string());
  }

  /// Validates the event's signature, rejects anything past
  /// `max_event_age`, and inserts it if not already present. Returns
  /// `true` iff newly accepted (§4.C "put").
  pub async fn put(&self, event: Event, source_relay: Option<String>) -> crate::Result<bool> {
    self.validate_freshness(&event)?;
    self.validate_signature(&event)?;

    let mut inner = self.inner.lock().await;
    if inner.entries.contains_key(&event.id) {
      Self::touch_recency(&mut inner.recency, &event.id);
      if let (Some(relay), Some(entry)) = (source_relay, inner.entries.get_mut(&event.id)) {
        if !entry.source_relays.contains(&relay) {
          entry.source_relays.push(relay);
        }
      }
      return Ok(false);
    }

    inner.indices.insert(&event);
    let id = event.id.clone();
    inner.entries.insert(
      id.clone(),
      CachedEntry {
        event: event.clone(),
        received_at: now_secs(),
        source_relays: source_relay.into_iter().collect(),
      },
    );
    inner.recency.push_back(id.clone());

    if let Persistence::Disk { dir, .. } = &self.config.persistence {
      disk::write_event(dir, &event).await?;
    }

    self.evict_if_over_capacity(&mut inner).await;
    Ok(true)
  }

  fn validate_freshness(&self, event: &Event) -> crate::Result<()> {
    let age = now_secs().saturating_sub(event.created_at);
    if age > self.config.max_event_age.as_secs() as i64 {
      return Err(Error::Cache(CacheError::Expired));
    }
    Ok(())
  }

  fn validate_signature(&self, event: &Event) -> crate::Result<()> {
    let digest = self.crypto.sha256(&event.canonical_preimage());
    let expected_id = hex::encode(digest);
    if expected_id != event.id {
      return Err(Error::Cache(CacheError::InvalidContent("id does not match canonical preimage".to_string())));
    }

    let sig_bytes: [u8; 64] = hex::decode(&event.sig)
      .ok()
      .and_then(|v| v.try_into().ok())
      .ok_or_else(|| Error::Cache(CacheError::InvalidContent("malformed signature".to_string())))?;
    let pubkey_bytes: [u8; 32] = hex::decode(&event.pubkey)
      .ok()
      .and_then(|v| v.try_into().ok())
      .ok_or_else(|| Error::Cache(CacheError::InvalidContent("malformed pubkey".to_string())))?;

    let verified = self
      .crypto
      .verify_schnorr(&digest, &sig_bytes, &pubkey_bytes)
      .map_err(|_| Error::Cache(CacheError::InvalidContent("signature verification failed".to_string())))?;
    if !verified {
      return Err(Error::Cache(CacheError::InvalidContent("signature does not verify".to_string())));
    }
    Ok(())
  }

  async fn evict_if_over_capacity(&self, inner: &mut Inner) {
    while inner.entries.len() > self.config.max_memory_events {
      let Some(oldest_id) = inner.recency.pop_front() else { break };
      if let Some(entry) = inner.entries.remove(&oldest_id) {
        inner.indices.remove(&entry.event);
      }
    }
  }

  /// Memory lookup first, falling through to disk on a miss (§4.C
  /// "get").
  pub async fn get(&self, id: &str) -> crate::Result<Option<Event>> {
    let mut inner = self.inner.lock().await;
    if let Some(entry) = inner.entries.get(id).cloned() {
      Self::touch_recency(&mut inner.recency, id);
      return Ok(Some(entry.event));
    }

    if let Persistence::Disk { dir, .. } = &self.config.persistence {
      if let Some(event) = disk::read_event(dir, id).await? {
        inner.indices.insert(&event);
        inner.entries.insert(
          id.to_string(),
          CachedEntry {
            event: event.clone(),
            received_at: now_secs(),
            source_relays: vec![],
          },
        );
        inner.recency.push_back(id.to_string());
        self.evict_if_over_capacity(&mut inner).await;
        return Ok(Some(event));
      }
    }
    Ok(None)
  }

  /// Matching events, newest-first, truncated by `filter.limit` (§4.C
  /// "query"). Only consults the in-memory set; callers that need
  /// disk-resident events back in memory should `get` them first.
  pub async fn query(&self, filter: &Filter) -> Vec<Event> {
    let inner = self.inner.lock().await;
    let candidate_ids = inner.indices.candidates(filter);

    let mut matched: Vec<&Event> = match candidate_ids {
      Some(ids) => ids
        .iter()
        .filter_map(|id| inner.entries.get(id))
        .map(|entry| &entry.event)
        .filter(|event| filter::matches(event, filter))
        .collect(),
      None => inner
        .entries
        .values()
        .map(|entry| &entry.event)
        .filter(|event| filter::matches(event, filter))
        .collect(),
    };

    if let Some(search) = &filter.search {
      matched.retain(|event| filter::matches_search(event, search));
    }

    matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let limit = filter.limit.map(|l| l as usize).unwrap_or(matched.len());
    matched.into_iter().take(limit).cloned().collect()
  }

  /// Removes an event from memory, disk, and every index (§4.C
  /// "remove").
  pub async fn remove(&self, id: &str) -> crate::Result<()> {
    let mut inner = self.inner.lock().await;
    self.remove_locked(&mut inner, id).await
  }

  async fn remove_locked(&self, inner: &mut Inner, id: &str) -> crate::Result<()> {
    if let Some(entry) = inner.entries.remove(id) {
      inner.indices.remove(&entry.event);
    }
    if let Some(pos) = inner.recency.iter().position(|existing| existing == id) {
      inner.recency.remove(pos);
    }
    if let Persistence::Disk { dir, .. } = &self.config.persistence {
      disk::remove_event(dir, id).await?;
    }
    Ok(())
  }

  /// NIP-09: removes every event the deletion event's `e` tags name,
  /// provided the target's author matches the deletion's author (§4.C
  /// "process_deletion").
  pub async fn process_deletion(&self, deletion: &Event) -> crate::Result<()> {
    if deletion.kind != EventKind::Deletion {
      return Ok(());
    }
    let targets: Vec<String> = deletion.tag_values("e").map(str::to_string).collect();

    let mut inner = self.inner.lock().await;
    for target_id in targets {
      let matches_author = inner
        .entries
        .get(&target_id)
        .is_some_and(|entry| entry.event.pubkey == deletion.pubkey);
      if matches_author {
        self.remove_locked(&mut inner, &target_id).await?;
      }
    }
    Ok(())
  }

  /// Wipes all in-memory state. Does not touch the disk tier; use
  /// `cleanup` for that (§4.C "clear").
  pub async fn clear(&self) {
    let mut inner = self.inner.lock().await;
    inner.entries.clear();
    inner.indices = Indices::new();
    inner.recency.clear();
  }

  /// Deletes disk files older than `max_age` and, if the directory still
  /// exceeds `max_size_bytes`, removes oldest-first until under the
  /// limit (§4.C "cleanup").
  pub async fn cleanup(&self, max_age: Duration) -> crate::Result<()> {
    if let Persistence::Disk { dir, max_size_bytes } = &self.config.persistence {
      disk::cleanup(dir, max_age, *max_size_bytes).await?;
    }
    Ok(())
  }

  pub async fn len(&self) -> usize {
    self.inner.lock().await.entries.len()
  }
}

fn now_secs() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .expect("system clock before unix epoch")
    .as_secs() as i64
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;
  use crate::crypto::Secp256k1Crypto;

  fn signed_event(crypto: &Secp256k1Crypto, secret: &[u8; 32], created_at: i64, content: &str) -> Event {
    let pubkey_bytes = crypto.x_only_public_key(secret).unwrap();
    let pubkey = hex::encode(pubkey_bytes);
    let tags = vec![];
    let kind = EventKind::Text;
    let preimage = nostr_proto::event::id::canonical_preimage(&pubkey, created_at, kind, &tags, content);
    let digest = crypto.sha256(&preimage);
    let sig = crypto.sign_schnorr(&digest, secret).unwrap();
    Event {
      id: hex::encode(digest),
      pubkey,
      created_at,
      kind,
      tags,
      content: content.to_string(),
      sig: hex::encode(sig),
    }
  }

  fn memory_cache() -> (EventCache, Secp256k1Crypto, [u8; 32]) {
    let crypto = Secp256k1Crypto::new();
    let secret = crypto.generate_secret_key();
    let cache = EventCache::new(CacheConfig::default(), Arc::new(crypto));
    (cache, Secp256k1Crypto::new(), secret)
  }

  #[tokio::test]
  async fn put_rejects_events_with_a_forged_id() {
    let (cache, crypto, secret) = memory_cache();
    let mut event = signed_event(&crypto, &secret, now_secs(), "hello");
    event.content = "tampered".to_string();
    assert!(cache.put(event, None).await.is_err());
  }

  #[tokio::test]
  async fn put_accepts_once_and_rejects_duplicate() {
    let (cache, crypto, secret) = memory_cache();
    let event = signed_event(&crypto, &secret, now_secs(), "hello");
    assert!(cache.put(event.clone(), Some("wss://relay.example.com".to_string())).await.unwrap());
    assert!(!cache.put(event, Some("wss://relay2.example.com".to_string())).await.unwrap());
    assert_eq!(cache.len().await, 1);
  }

  #[tokio::test]
  async fn query_returns_newest_first_and_respects_limit() {
    let (cache, crypto, secret) = memory_cache();
    for (i, content) in ["a", "b", "c"].into_iter().enumerate() {
      let event = signed_event(&crypto, &secret, now_secs() - (10 - i as i64), content);
      cache.put(event, None).await.unwrap();
    }
    let results = cache.query(&Filter::new().with_limit(2)).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].content, "c");
    assert_eq!(results[1].content, "b");
  }

  #[tokio::test]
  async fn lru_evicts_least_recently_used_on_overflow() {
    let crypto = Secp256k1Crypto::new();
    let secret = crypto.generate_secret_key();
    let mut config = CacheConfig::default();
    config.max_memory_events = 2;
    let cache = EventCache::new(config, Arc::new(Secp256k1Crypto::new()));

    let e1 = signed_event(&crypto, &secret, now_secs() - 3, "one");
    let e2 = signed_event(&crypto, &secret, now_secs() - 2, "two");
    let e3 = signed_event(&crypto, &secret, now_secs() - 1, "three");

    cache.put(e1.clone(), None).await.unwrap();
    cache.put(e2.clone(), None).await.unwrap();
    cache.put(e3, None).await.unwrap();

    assert_eq!(cache.len().await, 2);
    assert!(cache.get(&e1.id).await.unwrap().is_none());
    assert!(cache.get(&e2.id).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn process_deletion_only_removes_events_from_the_same_author() {
    let crypto = Secp256k1Crypto::new();
    let author_secret = crypto.generate_secret_key();
    let other_secret = crypto.generate_secret_key();
    let cache = EventCache::new(CacheConfig::default(), Arc::new(Secp256k1Crypto::new()));

    let target = signed_event(&crypto, &author_secret, now_secs(), "delete me");
    let not_owned = signed_event(&crypto, &other_secret, now_secs(), "not yours");
    cache.put(target.clone(), None).await.unwrap();
    cache.put(not_owned.clone(), None).await.unwrap();

    let deletion_pubkey = hex::encode(crypto.x_only_public_key(&author_secret).unwrap());
    let deletion_tags = vec![
      nostr_proto::Tag::new(["e", target.id.clone()]),
      nostr_proto::Tag::new(["e", not_owned.id.clone()]),
    ];
    let deletion_created_at = now_secs();
    let preimage = nostr_proto::event::id::canonical_preimage(
      &deletion_pubkey,
      deletion_created_at,
      EventKind::Deletion,
      &deletion_tags,
      "",
    );
    let digest = crypto.sha256(&preimage);
    let sig = crypto.sign_schnorr(&digest, &author_secret).unwrap();
    let deletion = Event {
      id: hex::encode(digest),
      pubkey: deletion_pubkey,
      created_at: deletion_created_at,
      kind: EventKind::Deletion,
      tags: deletion_tags,
      content: String::new(),
      sig: hex::encode(sig),
    };

    cache.process_deletion(&deletion).await.unwrap();
    assert!(cache.get(&target.id).await.unwrap().is_none());
    assert!(cache.get(&not_owned.id).await.unwrap().is_some());
  }
}
