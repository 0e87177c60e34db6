//! `RelayConnection` (§4.D): a single WebSocket to one relay, driven by
//! a state machine, with backoff, heartbeat, subscription replay and
//! NIP-42 auth. Built on the `RelayTransport` capability so the state
//! machine itself never touches `tokio-tungstenite` directly, unlike the
//! teacher's `RelayData` which owned the socket split inline.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use nostr_proto::{ClientMessage, Event, Filter, RelayMessage};
use rand::Rng;

use crate::buffer::{BoundedQueue, OverflowPolicy};
use crate::config::{ResilienceConfig, INBOUND_FRAME_BUFFER};
use crate::crypto::Crypto;
use crate::error::{AuthError, Error, ProtocolError, TransportError};
use crate::log_sink::{noop_sink, LogLevel, LogRecord, LogSink};
use crate::transport::RelayTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
  Reconnecting,
  Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthState {
  None,
  Authenticating,
  Authenticated(Instant),
  Failed(String),
}

/// Reconnect delay per §4.D: `min(max_delay, base * multiplier^n)` plus
/// uniform jitter in `[0, jitter_fraction * base]`.
pub fn backoff_delay(cfg: &ResilienceConfig, failure_count: u32) -> Duration {
  let scaled = cfg.backoff_base.as_secs_f64() * cfg.backoff_multiplier.powi(failure_count as i32);
  let base_component = scaled.min(cfg.backoff_max.as_secs_f64());
  let jitter_max = cfg.backoff_base.as_secs_f64() * cfg.jitter_fraction;
  let jitter = rand::thread_rng().gen_range(0.0..=jitter_max.max(0.0));
  Duration::from_secs_f64(base_component + jitter)
}

struct AuthSigner {
  crypto: Arc<dyn Crypto>,
  secret_key: [u8; 32],
  pubkey_hex: String,
}

/// An identity the connection can use to answer NIP-42 challenges. Held
/// separately from the KeyStore so a connection never needs direct
/// SecretStore access.
pub struct Authenticator {
  crypto: Arc<dyn Crypto>,
  secret_key: [u8; 32],
  pubkey_hex: String,
}

impl Authenticator {
  pub fn new(crypto: Arc<dyn Crypto>, secret_key: [u8; 32], pubkey_hex: impl Into<String>) -> Self {
    Self {
      crypto,
      secret_key,
      pubkey_hex: pubkey_hex.into(),
    }
  }

  fn into_signer(self) -> AuthSigner {
    AuthSigner {
      crypto: self.crypto,
      secret_key: self.secret_key,
      pubkey_hex: self.pubkey_hex,
    }
  }
}

pub struct RelayConnection {
  url: String,
  transport: Arc<dyn RelayTransport>,
  crypto: Arc<dyn Crypto>,
  log: Arc<dyn LogSink>,
  resilience: ResilienceConfig,
  authenticator: Option<AuthSigner>,

  state: StdMutex<ConnectionState>,
  auth_state: StdMutex<AuthState>,
  failure_count: AtomicU32,
  connected_at: StdMutex<Option<Instant>>,
  last_error: StdMutex<Option<String>>,

  /// Registered `{sub_id -> filters}`, insertion-ordered so replay on
  /// reconnect re-issues `REQ`s in the order they were first opened
  /// (§4.D "Subscription replay").
  subscriptions: StdMutex<Vec<(String, Vec<Filter>)>>,
  pending_auth_event_id: StdMutex<Option<String>>,

  inbound: BoundedQueue<RelayMessage>,
  malformed_frame_count: AtomicU64,

  heartbeat_sub_id: StdMutex<Option<String>>,
  last_pong: StdMutex<Option<Instant>>,
}

impl RelayConnection {
  pub fn new(
    url: impl Into<String>,
    transport: Arc<dyn RelayTransport>,
    crypto: Arc<dyn Crypto>,
    resilience: ResilienceConfig,
  ) -> Arc<Self> {
    Arc::new(Self {
      url: url.into(),
      transport,
      crypto,
      log: noop_sink(),
      resilience,
      authenticator: None,
      state: StdMutex::new(ConnectionState::Disconnected),
      auth_state: StdMutex::new(AuthState::None),
      failure_count: AtomicU32::new(0),
      connected_at: StdMutex::new(None),
      last_error: StdMutex::new(None),
      subscriptions: StdMutex::new(Vec::new()),
      pending_auth_event_id: StdMutex::new(None),
      inbound: BoundedQueue::new(INBOUND_FRAME_BUFFER, OverflowPolicy::DropOldest),
      malformed_frame_count: AtomicU64::new(0),
      heartbeat_sub_id: StdMutex::new(None),
      last_pong: StdMutex::new(None),
    })
  }

  pub fn with_log_sink(mut self, log: Arc<dyn LogSink>) -> Self {
    self.log = log;
    self
  }

  pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
    self.authenticator = Some(authenticator.into_signer());
    self
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn state(&self) -> ConnectionState {
    *self.state.lock().expect("state mutex poisoned")
  }

  pub fn auth_state(&self) -> AuthState {
    self.auth_state.lock().expect("auth state mutex poisoned").clone()
  }

  pub fn failure_count(&self) -> u32 {
    self.failure_count.load(Ordering::Relaxed)
  }

  pub fn connected_at(&self) -> Option<Instant> {
    *self.connected_at.lock().expect("connected_at mutex poisoned")
  }

  pub fn dropped_frame_count(&self) -> u64 {
    self.inbound.dropped_count()
  }

  pub fn malformed_frame_count(&self) -> u64 {
    self.malformed_frame_count.load(Ordering::Relaxed)
  }

  fn set_state(&self, new_state: ConnectionState) {
    *self.state.lock().expect("state mutex poisoned") = new_state;
  }

  fn emit(&self, level: LogLevel, message: String) {
    self.log.emit(LogRecord {
      level,
      target: "nostr_client_core::connection",
      message,
    });
  }

  /// Establishes the WebSocket and starts the inbound reader task. On
  /// success transitions to `Connected`; on failure transitions to
  /// `Failed`, increments `failure_count`, and schedules a reconnect
  /// when `auto_reconnect` is set (via `resilience`).
  pub async fn connect(self: &Arc<Self>) -> crate::Result<()> {
    self.set_state(ConnectionState::Connecting);
    match self.transport.connect().await {
      Ok(()) => {
        self.set_state(ConnectionState::Connected);
        *self.connected_at.lock().expect("connected_at mutex poisoned") = Some(Instant::now());
        self.failure_count.store(0, Ordering::Relaxed);
        self.emit(LogLevel::Info, format!("connected to {}", self.url));

        self.replay_subscriptions().await?;
        self.spawn_reader();
        Ok(())
      }
      Err(err) => {
        self.set_state(ConnectionState::Failed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().expect("last_error mutex poisoned") = Some(err.to_string());
        self.emit(LogLevel::Error, format!("connect to {} failed: {err}", self.url));
        Err(err)
      }
    }
  }

  async fn replay_subscriptions(&self) -> crate::Result<()> {
    let registered: Vec<(String, Vec<Filter>)> = self
      .subscriptions
      .lock()
      .expect("subscriptions mutex poisoned")
      .iter()
      .map(|(id, filters)| (id.clone(), filters.clone()))
      .collect();
    for (id, filters) in registered {
      let frame = ClientMessage::req(id, filters).as_json();
      self.transport.send(frame).await?;
    }
    Ok(())
  }

  fn spawn_reader(self: &Arc<Self>) {
    let this = Arc::clone(self);
    tokio::spawn(async move {
      loop {
        let Some(raw) = this.transport.next_message().await else {
          this.emit(LogLevel::Warn, format!("socket to {} closed", this.url));
          this.on_socket_closed();
          break;
        };
        match RelayMessage::from_json(&raw) {
          Ok(message) => this.handle_inbound(message).await,
          Err(_) => {
            this.malformed_frame_count.fetch_add(1, Ordering::Relaxed);
          }
        }
      }
    });
  }

  fn on_socket_closed(self: &Arc<Self>) {
    if self.resilience.auto_resubscribe {
      self.set_state(ConnectionState::Reconnecting);
      self.schedule_reconnect();
    } else {
      self.set_state(ConnectionState::Failed);
    }
  }

  fn schedule_reconnect(self: &Arc<Self>) {
    let this = Arc::clone(self);
    tokio::spawn(async move {
      let failure_count = this.failure_count.fetch_add(1, Ordering::Relaxed);
      if let Some(max) = this.resilience.max_reconnect_attempts {
        if failure_count >= max {
          this.set_state(ConnectionState::Failed);
          return;
        }
      }
      let delay = backoff_delay(&this.resilience, failure_count);
      tokio::time::sleep(delay).await;
      let _ = this.connect().await;
    });
  }

  async fn handle_inbound(self: &Arc<Self>, message: RelayMessage) {
    match &message {
      RelayMessage::Eose { subscription_id } => {
        let is_heartbeat = self
          .heartbeat_sub_id
          .lock()
          .expect("heartbeat mutex poisoned")
          .as_deref()
          == Some(subscription_id.as_str());
        if is_heartbeat {
          *self.last_pong.lock().expect("last_pong mutex poisoned") = Some(Instant::now());
          return;
        }
      }
      RelayMessage::Closed { subscription_id, .. } => {
        self
          .subscriptions
          .lock()
          .expect("subscriptions mutex poisoned")
          .retain(|(id, _)| id != subscription_id);
      }
      RelayMessage::Auth { challenge } => {
        self.respond_to_auth_challenge(challenge).await;
      }
      RelayMessage::Ok {
        event_id, accepted, message,
      } => {
        let is_pending_auth = self
          .pending_auth_event_id
          .lock()
          .expect("pending auth mutex poisoned")
          .as_deref()
          == Some(event_id.as_str());
        if is_pending_auth {
          let mut auth_state = self.auth_state.lock().expect("auth state mutex poisoned");
          *auth_state = if *accepted {
            AuthState::Authenticated(Instant::now())
          } else {
            AuthState::Failed(message.clone())
          };
        }
      }
      _ => {}
    }
    self.inbound.push(message).await;
  }

  async fn respond_to_auth_challenge(self: &Arc<Self>, challenge: &str) {
    let Some(signer) = &self.authenticator else {
      *self.auth_state.lock().expect("auth state mutex poisoned") = AuthState::Failed(
        Error::Auth(AuthError::ChallengeOutstanding).to_string(),
      );
      return;
    };

    *self.auth_state.lock().expect("auth state mutex poisoned") = AuthState::Authenticating;

    let created_at = chrono_like_now();
    let tags = vec![
      nostr_proto::Tag::new(["relay", self.url.clone()]),
      nostr_proto::Tag::new(["challenge", challenge.to_string()]),
    ];
    let content = String::new();
    let kind = nostr_proto::EventKind::from(22242u64);

    let pubkey = signer.pubkey_hex.clone();
    let preimage = nostr_proto::event::id::canonical_preimage(&pubkey, created_at, kind, &tags, &content);
    let digest = signer.crypto.sha256(&preimage);
    let id = hex::encode(digest);
    let Ok(sig_bytes) = signer.crypto.sign_schnorr(&digest, &signer.secret_key) else {
      *self.auth_state.lock().expect("auth state mutex poisoned") =
        AuthState::Failed("failed to sign auth event".to_string());
      return;
    };

    let event = Event {
      id: id.clone(),
      pubkey,
      created_at,
      kind,
      tags,
      content,
      sig: hex::encode(sig_bytes),
    };

    *self.pending_auth_event_id.lock().expect("pending auth mutex poisoned") = Some(id);
    let frame = ClientMessage::auth(event).as_json();
    if let Err(err) = self.transport.send(frame).await {
      *self.auth_state.lock().expect("auth state mutex poisoned") = AuthState::Failed(err.to_string());
    }
  }

  pub async fn publish(&self, event: Event) -> crate::Result<()> {
    self.transport.send(ClientMessage::event(event).as_json()).await
  }

  pub async fn subscribe(&self, id: impl Into<String>, filters: Vec<Filter>) -> crate::Result<()> {
    let id = id.into();
    {
      let mut subscriptions = self.subscriptions.lock().expect("subscriptions mutex poisoned");
      match subscriptions.iter_mut().find(|(existing, _)| *existing == id) {
        Some((_, existing_filters)) => *existing_filters = filters.clone(),
        None => subscriptions.push((id.clone(), filters.clone())),
      }
    }
    self.transport.send(ClientMessage::req(id, filters).as_json()).await
  }

  pub async fn close_subscription(&self, id: &str) -> crate::Result<()> {
    self
      .subscriptions
      .lock()
      .expect("subscriptions mutex poisoned")
      .retain(|(existing, _)| existing != id);
    self.transport.send(ClientMessage::close(id).as_json()).await
  }

  /// Issues a zero-limit `REQ` as a heartbeat ping; the matching `EOSE`
  /// is consumed internally as the pong (§4.D "Heartbeat").
  pub async fn send_heartbeat_ping(&self, sub_id: impl Into<String>) -> crate::Result<()> {
    let sub_id = sub_id.into();
    *self.heartbeat_sub_id.lock().expect("heartbeat mutex poisoned") = Some(sub_id.clone());
    let filter = Filter::new().with_limit(0);
    self.transport.send(ClientMessage::req(sub_id, vec![filter]).as_json()).await
  }

  /// `true` if a pong has arrived within `heartbeat_timeout` of the
  /// last check, or no ping has been sent yet.
  pub fn heartbeat_healthy(&self) -> bool {
    match *self.last_pong.lock().expect("last_pong mutex poisoned") {
      None => true,
      Some(t) => t.elapsed() <= self.resilience.heartbeat_timeout,
    }
  }

  pub fn declare_heartbeat_lost(self: &Arc<Self>) {
    self.emit(LogLevel::Warn, format!("heartbeat lost for {}", self.url));
    self.on_socket_closed();
  }

  /// Pulls the next inbound frame the Pool should react to. Heartbeat
  /// pongs are consumed internally and never surfaced here.
  pub async fn next_message(&self) -> Option<RelayMessage> {
    self.inbound.pop().await
  }

  pub async fn disconnect(&self) {
    self.transport.disconnect().await;
    self.set_state(ConnectionState::Disconnected);
    self.inbound.close();
  }
}

/// `created_at` uses Unix seconds; the runtime doesn't assume a wall
/// clock source is wired in at this layer, so the caller's notion of
/// "now" is injected here as a tiny seam instead of calling
/// `SystemTime::now()` all over the connection.
fn chrono_like_now() -> i64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .expect("system clock before unix epoch")
    .as_secs() as i64
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  fn test_resilience() -> ResilienceConfig {
    ResilienceConfig {
      backoff_base: Duration::from_millis(100),
      backoff_max: Duration::from_secs(10),
      backoff_multiplier: 2.0,
      jitter_fraction: 0.3,
      ..Default::default()
    }
  }

  #[test]
  fn backoff_grows_exponentially_and_caps_at_max() {
    let cfg = test_resilience();
    let d0 = backoff_delay(&cfg, 0);
    let d3 = backoff_delay(&cfg, 3);
    let d10 = backoff_delay(&cfg, 10);

    assert!(d0.as_secs_f64() >= 0.1 && d0.as_secs_f64() <= 0.1 + 0.03 + 1e-9);
    assert!(d3.as_secs_f64() >= 0.8 && d3 < d10);
    assert!(d10.as_secs_f64() <= cfg.backoff_max.as_secs_f64() + 0.03 + 1e-9);
  }

  #[test]
  fn backoff_includes_bounded_jitter() {
    let cfg = test_resilience();
    for _ in 0..20 {
      let delay = backoff_delay(&cfg, 1);
      assert!(delay.as_secs_f64() >= 0.2);
      assert!(delay.as_secs_f64() <= 0.2 + 0.03 + 1e-9);
    }
  }

  struct RecordingTransport {
    sent: StdMutex<Vec<String>>,
  }

  impl RecordingTransport {
    fn new() -> Arc<Self> {
      Arc::new(Self { sent: StdMutex::new(Vec::new()) })
    }
  }

  #[async_trait::async_trait]
  impl RelayTransport for RecordingTransport {
    async fn connect(&self) -> crate::Result<()> {
      Ok(())
    }
    async fn disconnect(&self) {}
    async fn send(&self, frame: String) -> crate::Result<()> {
      self.sent.lock().expect("sent mutex poisoned").push(frame);
      Ok(())
    }
    async fn next_message(&self) -> Option<String> {
      std::future::pending().await
    }
  }

  /// Regression test for §4.D "Subscription replay": registering `"b"`
  /// then `"a"` must re-issue `REQ b` before `REQ a` on reconnect (S4),
  /// not in `HashMap` iteration order.
  #[tokio::test]
  async fn replay_reissues_subscriptions_in_registration_order() {
    let transport = RecordingTransport::new();
    let crypto: Arc<dyn Crypto> = Arc::new(crate::crypto::Secp256k1Crypto::new());
    let connection = RelayConnection::new(
      "wss://relay.example.com",
      Arc::clone(&transport) as Arc<dyn RelayTransport>,
      crypto,
      ResilienceConfig::default(),
    );

    connection.subscribe("b", vec![Filter::new().with_limit(1)]).await.unwrap();
    connection.subscribe("a", vec![Filter::new().with_limit(2)]).await.unwrap();
    transport.sent.lock().expect("sent mutex poisoned").clear();

    connection.replay_subscriptions().await.unwrap();

    let sent = transport.sent.lock().expect("sent mutex poisoned").clone();
    assert_eq!(sent.len(), 2);
    assert!(sent[0].starts_with("[\"REQ\",\"b\""));
    assert!(sent[1].starts_with("[\"REQ\",\"a\""));
  }
}
