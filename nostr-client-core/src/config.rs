//! Configuration surface (§6 "Configuration surface (enumerated)").
//!
//! Every long-lived component takes its own config struct at construction,
//! each `Default`-able with the values named or implied by the spec.

use std::path::PathBuf;
use std::time::Duration;

/// RelayPool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
  pub max_connections: usize,
  pub initial_reconnect_delay: Duration,
  pub max_reconnect_delay: Duration,
  pub backoff_multiplier: f64,
  pub health_check_timeout: Duration,
  pub min_health: f64,
  pub auto_reconnect: bool,
  pub auto_discover_relays: bool,
  pub publish_ack_timeout: Duration,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      max_connections: 32,
      initial_reconnect_delay: Duration::from_millis(500),
      max_reconnect_delay: Duration::from_secs(60),
      backoff_multiplier: 2.0,
      health_check_timeout: Duration::from_secs(10),
      min_health: 0.3,
      auto_reconnect: true,
      auto_discover_relays: true,
      publish_ack_timeout: Duration::from_secs(5),
    }
  }
}

/// Where the EventCache spills to disk, if at all.
#[derive(Debug, Clone, PartialEq)]
pub enum Persistence {
  Memory,
  Disk { dir: PathBuf, max_size_bytes: u64 },
}

/// EventCache configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
  pub max_memory_events: usize,
  pub max_event_age: Duration,
  pub persistence: Persistence,
  pub auto_cleanup: bool,
  pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_memory_events: 10_000,
      max_event_age: Duration::from_secs(30 * 24 * 60 * 60),
      persistence: Persistence::Memory,
      auto_cleanup: true,
      cleanup_interval: Duration::from_secs(3600),
    }
  }
}

/// Per-subscription behavior (§3 "ManagedSubscription").
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOptions {
  pub auto_renew: bool,
  pub cache_results: bool,
  pub deduplicate: bool,
  pub inactivity_timeout: Option<Duration>,
  pub close_after_eose: bool,
  pub max_buffer: usize,
  pub priority: u8,
}

impl Default for SubscriptionOptions {
  fn default() -> Self {
    Self {
      auto_renew: true,
      cache_results: true,
      deduplicate: true,
      inactivity_timeout: None,
      close_after_eose: false,
      max_buffer: 1000,
      priority: 0,
    }
  }
}

/// Connection resilience knobs shared by every RelayConnection (§4.D, §6).
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
  pub heartbeat_interval: Duration,
  pub heartbeat_timeout: Duration,
  pub auto_resubscribe: bool,
  pub max_reconnect_attempts: Option<u32>,
  pub backoff_base: Duration,
  pub backoff_max: Duration,
  pub backoff_multiplier: f64,
  pub jitter_fraction: f64,
}

impl Default for ResilienceConfig {
  fn default() -> Self {
    Self {
      heartbeat_interval: Duration::from_secs(30),
      heartbeat_timeout: Duration::from_secs(10),
      auto_resubscribe: true,
      max_reconnect_attempts: None,
      backoff_base: Duration::from_millis(500),
      backoff_max: Duration::from_secs(60),
      backoff_multiplier: 2.0,
      jitter_fraction: 0.3,
    }
  }
}

/// NIP-46/NIP-47 overlay configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayConfig {
  pub request_timeout: Duration,
  pub rate_limit_per_minute: u32,
  pub max_reconnect_attempts: Option<u32>,
}

impl Default for OverlayConfig {
  fn default() -> Self {
    Self {
      request_timeout: Duration::from_secs(30),
      rate_limit_per_minute: 30,
      max_reconnect_attempts: None,
    }
  }
}

pub const ONE_SHOT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEDUP_SET_CAPACITY: usize = 100_000;
pub const INBOUND_FRAME_BUFFER: usize = 100;
