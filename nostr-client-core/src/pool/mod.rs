//! `RelayPool` (§4.E): maintains `url -> Relay`, fans out publishes with
//! per-relay OK tracking, aggregates subscriptions across relays with
//! dedup, and scores relay health. Generalizes the teacher's
//! `client/src/pool.rs` `RelayPool` from a single hardcoded relay and a
//! shared unbounded "everything funnels through one channel" design to
//! a map of independently healthy/unhealthy relays, each with its own
//! `RelayConnection`.

pub mod health;
pub mod nip11;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future;
use nostr_proto::{Event, Filter};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::connection::{ConnectionState, RelayConnection};
use crate::crypto::Crypto;
use crate::error::{Error, PublicationError, TransportError};
use crate::log_sink::{noop_sink, LogLevel, LogRecord, LogSink};
use crate::transport::TungsteniteTransport;
pub use health::HealthEvent;
pub use nip11::RelayInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
  Disconnected,
  Connecting,
  Connected,
  Reconnecting,
  Failed,
}

impl From<ConnectionState> for RelayState {
  fn from(s: ConnectionState) -> Self {
    match s {
      ConnectionState::Disconnected => Self::Disconnected,
      ConnectionState::Connecting => Self::Connecting,
      ConnectionState::Connected => Self::Connected,
      ConnectionState::Reconnecting => Self::Reconnecting,
      ConnectionState::Failed => Self::Failed,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelayMetadata {
  pub read: bool,
  pub write: bool,
  pub primary: bool,
}

impl Default for RelayMetadata {
  fn default() -> Self {
    Self {
      read: true,
      write: true,
      primary: false,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
  pub sent: u64,
  pub received: u64,
  pub subs: u64,
  pub avg_rt: Duration,
  pub last_activity: Option<Instant>,
}

/// A point-in-time snapshot of one relay's bookkeeping (§3 "Relay
/// record"). The live state lives on `RelayEntry`; this is what callers
/// observe.
#[derive(Debug, Clone)]
pub struct RelayRecord {
  pub url: String,
  pub state: RelayState,
  pub health: f64,
  pub failure_count: u32,
  pub last_connected_at: Option<Instant>,
  pub last_error: Option<String>,
  pub info: Option<RelayInfo>,
  pub metadata: RelayMetadata,
  pub stats: RelayStats,
}

struct RelayEntry {
  connection: Arc<RelayConnection>,
  metadata: RelayMetadata,
  health: Mutex<f64>,
  info: Mutex<Option<RelayInfo>>,
  stats: Mutex<RelayStats>,
}

#[derive(Debug, Clone)]
pub struct PublishResult {
  pub relay: String,
  pub accepted: bool,
  pub message: Option<String>,
  pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum PoolSubscriptionEvent {
  Event(Box<Event>),
  Eose,
  Closed(String),
}

struct PoolSubState {
  relays: HashSet<String>,
  eose_received: Mutex<HashSet<String>>,
  seen_ids: Mutex<HashSet<String>>,
  sender: mpsc::UnboundedSender<PoolSubscriptionEvent>,
}

/// Aggregated, deduplicated event stream across every relay a
/// subscription was issued on (§4.E "subscribe").
pub struct PoolSubscription {
  id: String,
  receiver: mpsc::UnboundedReceiver<PoolSubscriptionEvent>,
}

impl PoolSubscription {
  pub fn id(&self) -> &str {
    &self.id
  }

  pub async fn recv(&mut self) -> Option<PoolSubscriptionEvent> {
    self.receiver.recv().await
  }
}

const SEEN_ID_CAP: usize = 100_000;

pub struct RelayPool {
  relays: Mutex<HashMap<String, RelayEntry>>,
  config: PoolConfig,
  crypto: Arc<dyn Crypto>,
  log: Arc<dyn LogSink>,
  http: reqwest::Client,
  pending_oks: Mutex<HashMap<(String, String), oneshot::Sender<(bool, String)>>>,
  pool_subs: Mutex<HashMap<String, Arc<PoolSubState>>>,
  health_delegate: Mutex<Option<Box<dyn Fn(&str, bool) + Send + Sync>>>,
  sent_counter: AtomicU64,
}

impl RelayPool {
  pub fn new(config: PoolConfig, crypto: Arc<dyn Crypto>) -> Arc<Self> {
    Arc::new(Self {
      relays: Mutex::new(HashMap::new()),
      config,
      crypto,
      log: noop_sink(),
      http: reqwest::Client::new(),
      pending_oks: Mutex::new(HashMap::new()),
      pool_subs: Mutex::new(HashMap::new()),
      health_delegate: Mutex::new(None),
      sent_counter: AtomicU64::new(0),
    })
  }

  pub fn with_log_sink(self: Arc<Self>, log: Arc<dyn LogSink>) -> Arc<Self> {
    // `Arc::get_mut` would require unique ownership we don't have at
    // this point in construction, so the log sink is wired in before
    // any relay is added and stored behind a fresh Arc instead.
    Arc::new(Self {
      relays: Mutex::new(HashMap::new()),
      config: self.config.clone(),
      crypto: Arc::clone(&self.crypto),
      log,
      http: self.http.clone(),
      pending_oks: Mutex::new(HashMap::new()),
      pool_subs: Mutex::new(HashMap::new()),
      health_delegate: Mutex::new(None),
      sent_counter: AtomicU64::new(0),
    })
  }

  pub async fn set_health_delegate(&self, delegate: impl Fn(&str, bool) + Send + Sync + 'static) {
    *self.health_delegate.lock().await = Some(Box::new(delegate));
  }

  fn emit(&self, level: LogLevel, message: String) {
    self.log.emit(LogRecord {
      level,
      target: "nostr_client_core::pool",
      message,
    });
  }

  fn validate_url(url: &str) -> crate::Result<()> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
      Ok(())
    } else {
      Err(Error::Transport(TransportError::InvalidUrl(url.to_string())))
    }
  }

  /// Adds a relay and starts its dispatcher task. Connection is not
  /// established until `connect`/`connect_all`.
  pub async fn add(self: &Arc<Self>, url: impl Into<String>, metadata: RelayMetadata) -> crate::Result<()> {
    let url = url.into();
    Self::validate_url(&url)?;

    let mut relays = self.relays.lock().await;
    if relays.len() >= self.config.max_connections {
      return Err(Error::Transport(TransportError::InvalidUrl(format!(
        "max_connections ({}) reached",
        self.config.max_connections
      ))));
    }
    if relays.contains_key(&url) {
      return Ok(());
    }

    let transport = Arc::new(TungsteniteTransport::new(url.clone()));
    let resilience = crate::config::ResilienceConfig::default();
    let connection = RelayConnection::new(url.clone(), transport, Arc::clone(&self.crypto), resilience);

    relays.insert(
      url.clone(),
      RelayEntry {
        connection: Arc::clone(&connection),
        metadata,
        health: Mutex::new(1.0),
        info: Mutex::new(None),
        stats: Mutex::new(RelayStats::default()),
      },
    );
    drop(relays);

    self.spawn_dispatcher(url, connection);
    Ok(())
  }

  pub async fn remove(&self, url: &str) {
    if let Some(entry) = self.relays.lock().await.remove(url) {
      entry.connection.disconnect().await;
    }
  }

  fn spawn_dispatcher(self: &Arc<Self>, url: String, connection: Arc<RelayConnection>) {
    let pool = Arc::clone(self);
    tokio::spawn(async move {
      loop {
        let Some(message) = connection.next_message().await else {
          break;
        };
        pool.route_message(&url, message).await;
      }
    });
  }

  async fn route_message(&self, url: &str, message: nostr_proto::RelayMessage) {
    use nostr_proto::RelayMessage;
    match message {
      RelayMessage::Event { subscription_id, event } => {
        self.dispatch_event(&subscription_id, event).await;
      }
      RelayMessage::Eose { subscription_id } => {
        self.dispatch_eose(url, &subscription_id).await;
      }
      RelayMessage::Closed { subscription_id, message } => {
        let pool_subs = self.pool_subs.lock().await;
        if let Some(sub) = pool_subs.get(&subscription_id) {
          let _ = sub.sender.send(PoolSubscriptionEvent::Closed(message));
        }
      }
      RelayMessage::Ok {
        event_id, accepted, message,
      } => {
        self.dispatch_ok(url, &event_id, accepted, message).await;
      }
      RelayMessage::Notice { message } => {
        self.emit(LogLevel::Info, format!("NOTICE from {url}: {message}"));
      }
      RelayMessage::Auth { .. } => {}
    }
  }

  async fn dispatch_event(&self, subscription_id: &str, event: Box<Event>) {
    let pool_subs = self.pool_subs.lock().await;
    let Some(sub) = pool_subs.get(subscription_id) else {
      return;
    };
    let mut seen = sub.seen_ids.lock().await;
    if seen.len() >= SEEN_ID_CAP {
      seen.clear();
    }
    if !seen.insert(event.id.clone()) {
      return;
    }
    drop(seen);
    let _ = sub.sender.send(PoolSubscriptionEvent::Event(event));
  }

  async fn dispatch_eose(&self, url: &str, subscription_id: &str) {
    let pool_subs = self.pool_subs.lock().await;
    let Some(sub) = pool_subs.get(subscription_id) else {
      return;
    };
    let mut eose_received = sub.eose_received.lock().await;
    eose_received.insert(url.to_string());
    if eose_received.len() >= sub.relays.len() {
      let _ = sub.sender.send(PoolSubscriptionEvent::Eose);
    }
  }

  async fn dispatch_ok(&self, url: &str, event_id: &str, accepted: bool, message: String) {
    let key = (url.to_string(), event_id.to_string());
    if let Some(tx) = self.pending_oks.lock().await.remove(&key) {
      let _ = tx.send((accepted, message));
    }
    self
      .adjust_health(
        url,
        if accepted {
          HealthEvent::PublishSuccess
        } else {
          HealthEvent::EventRejected
        },
      )
      .await;
  }

  async fn adjust_health(&self, url: &str, event: HealthEvent) {
    let relays = self.relays.lock().await;
    let Some(entry) = relays.get(url) else {
      return;
    };
    let mut health = entry.health.lock().await;
    let before = *health;
    *health = health::apply(*health, event);
    let after = *health;
    drop(health);
    drop(relays);

    let min_health = self.config.min_health;
    let crossed_down = before >= min_health && after < min_health;
    let crossed_up = before < min_health && after >= min_health;
    if crossed_down || crossed_up {
      if let Some(delegate) = self.health_delegate.lock().await.as_ref() {
        delegate(url, after >= min_health);
      }
    }
  }

  pub async fn connect(self: &Arc<Self>, url: &str) -> crate::Result<()> {
    let connection = {
      let relays = self.relays.lock().await;
      relays.get(url).map(|e| Arc::clone(&e.connection))
    };
    let Some(connection) = connection else {
      return Err(Error::Transport(TransportError::InvalidUrl(url.to_string())));
    };

    let result = connection.connect().await;
    match &result {
      Ok(()) => {
        self.adjust_health(url, HealthEvent::ConnectionSuccess).await;
        if self.config.auto_discover_relays {
          self.discover_relay_info(url).await;
        }
      }
      Err(_) => {
        self.adjust_health(url, HealthEvent::ConnectionFailure).await;
      }
    }
    result
  }

  async fn discover_relay_info(&self, url: &str) {
    match nip11::fetch(&self.http, url).await {
      Ok(info) => {
        if let Some(entry) = self.relays.lock().await.get(url) {
          *entry.info.lock().await = Some(info);
        }
      }
      Err(err) => {
        self.emit(LogLevel::Debug, format!("NIP-11 fetch failed for {url}: {err}"));
      }
    }
  }

  pub async fn connect_all(self: &Arc<Self>) {
    let urls: Vec<String> = self.relays.lock().await.keys().cloned().collect();
    for url in urls {
      let _ = self.connect(&url).await;
    }
  }

  pub async fn disconnect(&self, url: &str) {
    if let Some(entry) = self.relays.lock().await.get(url) {
      entry.connection.disconnect().await;
    }
  }

  pub async fn disconnect_all(&self) {
    let urls: Vec<String> = self.relays.lock().await.keys().cloned().collect();
    for url in urls {
      self.disconnect(&url).await;
    }
  }

  pub async fn record(&self, url: &str) -> Option<RelayRecord> {
    let relays = self.relays.lock().await;
    let entry = relays.get(url)?;
    Some(RelayRecord {
      url: url.to_string(),
      state: entry.connection.state().into(),
      health: *entry.health.lock().await,
      failure_count: entry.connection.failure_count(),
      last_connected_at: entry.connection.connected_at(),
      last_error: None,
      info: entry.info.lock().await.clone(),
      metadata: entry.metadata,
      stats: entry.stats.lock().await.clone(),
    })
  }

  /// Fans an event out to every healthy, write-enabled relay (or the
  /// given `targets`), tracking each relay's `OK` independently (§4.E
  /// "publish").
  pub async fn publish(&self, event: Event, targets: Option<Vec<String>>) -> Vec<PublishResult> {
    let candidates = self.select_targets(targets, true).await;
    if candidates.is_empty() {
      return vec![];
    }

    let mut waiters = Vec::with_capacity(candidates.len());
    {
      let relays = self.relays.lock().await;
      let mut pending = self.pending_oks.lock().await;
      for url in &candidates {
        let Some(entry) = relays.get(url) else { continue };
        let (tx, rx) = oneshot::channel();
        pending.insert((url.clone(), event.id.clone()), tx);
        waiters.push((url.clone(), Arc::clone(&entry.connection), rx));
      }
    }

    // Send the EVENT frame to every relay before waiting on any OK, so a
    // slow or non-responding relay can't stall delivery to the others
    // (§4.E "fans out", §5 "Timeouts do not affect event acceptance by
    // other relays").
    let mut results = Vec::with_capacity(waiters.len());
    let mut pending_waiters = Vec::with_capacity(waiters.len());
    for (url, connection, rx) in waiters {
      match connection.publish(event.clone()).await {
        Ok(()) => {
          self.sent_counter.fetch_add(1, Ordering::Relaxed);
          pending_waiters.push((url, rx));
        }
        Err(err) => {
          self.adjust_health(&url, HealthEvent::PublishFailure).await;
          self.pending_oks.lock().await.remove(&(url.clone(), event.id.clone()));
          results.push(PublishResult {
            relay: url,
            accepted: false,
            message: None,
            error: Some(err.to_string()),
          });
        }
      }
    }

    let ack_timeout = self.config.publish_ack_timeout;
    let awaited = future::join_all(pending_waiters.into_iter().map(|(url, rx)| async move {
      let outcome = tokio::time::timeout(ack_timeout, rx).await;
      (url, outcome)
    }))
    .await;

    for (url, outcome) in awaited {
      match outcome {
        Ok(Ok((accepted, message))) => results.push(PublishResult {
          relay: url,
          accepted,
          message: Some(message),
          error: None,
        }),
        Ok(Err(_)) => results.push(PublishResult {
          relay: url,
          accepted: false,
          message: None,
          error: Some("publication tracker dropped".to_string()),
        }),
        Err(_) => {
          self.adjust_health(&url, HealthEvent::Timeout).await;
          self.pending_oks.lock().await.remove(&(url.clone(), event.id.clone()));
          results.push(PublishResult {
            relay: url,
            accepted: false,
            message: None,
            error: Some(Error::Publication(PublicationError::AckTimeout).to_string()),
          });
        }
      }
    }
    results
  }

  async fn select_targets(&self, targets: Option<Vec<String>>, require_write: bool) -> Vec<String> {
    let relays = self.relays.lock().await;
    let mut selected = Vec::new();
    for (url, entry) in relays.iter() {
      if let Some(targets) = &targets {
        if !targets.contains(url) {
          continue;
        }
      }
      let healthy = *entry.health.lock().await >= self.config.min_health;
      let allowed = if require_write { entry.metadata.write } else { entry.metadata.read };
      if healthy && allowed {
        selected.push(url.clone());
      }
    }
    selected
  }

  /// Issues a subscription on every readable, healthy relay and
  /// aggregates their streams with cross-relay dedup (§4.E "subscribe").
  pub async fn subscribe(&self, filters: Vec<Filter>, id: Option<String>) -> crate::Result<PoolSubscription> {
    let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let targets = self.select_targets(None, false).await;
    if targets.is_empty() {
      return Err(Error::Subscription(crate::error::SubscriptionError::InvalidFilter));
    }

    let (sender, receiver) = mpsc::unbounded_channel();
    let sub_state = Arc::new(PoolSubState {
      relays: targets.iter().cloned().collect(),
      eose_received: Mutex::new(HashSet::new()),
      seen_ids: Mutex::new(HashSet::new()),
      sender,
    });
    self.pool_subs.lock().await.insert(id.clone(), sub_state);

    let relays = self.relays.lock().await;
    for url in &targets {
      if let Some(entry) = relays.get(url) {
        let _ = entry.connection.subscribe(id.clone(), filters.clone()).await;
      }
    }
    drop(relays);

    Ok(PoolSubscription { id, receiver })
  }

  pub async fn close_subscription(&self, id: &str) {
    let Some(sub_state) = self.pool_subs.lock().await.remove(id) else {
      return;
    };
    let relays = self.relays.lock().await;
    for url in &sub_state.relays {
      if let Some(entry) = relays.get(url) {
        let _ = entry.connection.close_subscription(id).await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[tokio::test]
  async fn add_rejects_non_websocket_schemes() {
    let pool = RelayPool::new(PoolConfig::default(), Arc::new(crate::crypto::Secp256k1Crypto::new()));
    let err = pool.add("https://relay.example.com", RelayMetadata::default()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::InvalidUrl(_))));
  }

  #[tokio::test]
  async fn add_is_bounded_by_max_connections() {
    let mut config = PoolConfig::default();
    config.max_connections = 1;
    let pool = RelayPool::new(config, Arc::new(crate::crypto::Secp256k1Crypto::new()));
    pool.add("wss://relay-a.example.com", RelayMetadata::default()).await.unwrap();
    let err = pool.add("wss://relay-b.example.com", RelayMetadata::default()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::InvalidUrl(_))));
  }

  #[tokio::test]
  async fn subscribe_with_no_relays_fails() {
    let pool = RelayPool::new(PoolConfig::default(), Arc::new(crate::crypto::Secp256k1Crypto::new()));
    let result = pool.subscribe(vec![Filter::new()], None).await;
    assert!(result.is_err());
  }
}
