//! Error taxonomy (§7). Each concern gets its own `thiserror` enum;
//! `Error` unifies them for call sites that span components, the way the
//! teacher's `client_to_relay_communication::Error` wraps `serde_json::Error`
//! for its one concern.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("invalid relay url: {0}")]
  InvalidUrl(String),
  #[error("dns resolution failed for {0}")]
  DnsFailure(String),
  #[error("tls handshake failed: {0}")]
  TlsFailure(String),
  #[error("connection timed out")]
  Timeout,
  #[error("socket closed: {0}")]
  SocketClosed(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
  #[error(transparent)]
  MalformedFrame(#[from] nostr_proto::message::Error),
  #[error("unexpected frame in current state")]
  UnexpectedFrame,
  #[error("event signature did not verify")]
  InvalidSignature,
}

#[derive(Debug, Error)]
pub enum AuthError {
  #[error("auth challenge outstanding, no authenticator configured")]
  ChallengeOutstanding,
  #[error("relay rejected authentication: {0}")]
  Rejected(String),
}

#[derive(Debug, Error)]
pub enum PublicationError {
  #[error("relay rejected event: {0}")]
  Rejected(String),
  #[error("timed out waiting for OK")]
  AckTimeout,
  #[error("no relays accepted the event")]
  NoRelaysAccepted,
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
  #[error("relay closed subscription: {0}")]
  Closed(String),
  #[error("subscription not found: {0}")]
  NotFound(String),
  #[error("invalid filter")]
  InvalidFilter,
}

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("event content rejected: {0}")]
  InvalidContent(String),
  #[error("event older than max_event_age")]
  Expired,
  #[error("disk I/O failure: {0}")]
  Disk(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum OverlayError {
  #[error("request timed out")]
  Timeout,
  #[error("unsupported method: {0}")]
  UnsupportedMethod(String),
  #[error("rate limited, retry after {retry_after_secs:?}s")]
  RateLimited { retry_after_secs: Option<u64> },
  #[error("failed to decrypt payload")]
  DecryptionFailure,
  #[error("wallet service error {code}: {message}")]
  ServiceError { code: String, message: String },
  #[error("no active connection")]
  NoActiveConnection,
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
  #[error("identity not found: {0}")]
  IdentityMissing(String),
  #[error("identity already exists: {0}")]
  IdentityDuplicate(String),
  #[error("permission denied")]
  PermissionDenied,
  #[error("permission expired or exhausted")]
  PermissionExpired,
  #[error("backup is corrupted: {0}")]
  BackupCorrupt(String),
  #[error("platform crypto failure: {0}")]
  PlatformCryptoFailure(String),
}

/// Top-level error uniting every concern, carrying a stable kind plus a
/// human message, recoverability hint and optional suggested retry delay
/// (§7 "User-visible behavior").
#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error(transparent)]
  Protocol(#[from] ProtocolError),
  #[error(transparent)]
  Auth(#[from] AuthError),
  #[error(transparent)]
  Publication(#[from] PublicationError),
  #[error(transparent)]
  Subscription(#[from] SubscriptionError),
  #[error(transparent)]
  Cache(#[from] CacheError),
  #[error(transparent)]
  Overlay(#[from] OverlayError),
  #[error(transparent)]
  KeyStore(#[from] KeyStoreError),
}

impl Error {
  /// Whether a caller can reasonably retry the operation that produced
  /// this error.
  pub fn is_recoverable(&self) -> bool {
    match self {
      Error::Transport(_) => true,
      Error::Protocol(ProtocolError::InvalidSignature) => false,
      Error::Protocol(_) => true,
      Error::Auth(_) => true,
      Error::Publication(PublicationError::NoRelaysAccepted) => true,
      Error::Publication(_) => true,
      Error::Subscription(_) => true,
      Error::Cache(CacheError::InvalidContent(_) | CacheError::Expired) => false,
      Error::Cache(CacheError::Disk(_)) => true,
      Error::Overlay(OverlayError::UnsupportedMethod(_)) => false,
      Error::Overlay(_) => true,
      Error::KeyStore(KeyStoreError::IdentityDuplicate(_)) => false,
      Error::KeyStore(_) => true,
    }
  }

  /// A suggested retry delay, when the error carries one (e.g. a relay's
  /// `retry-after` on rate limiting).
  pub fn suggested_retry_delay(&self) -> Option<std::time::Duration> {
    match self {
      Error::Overlay(OverlayError::RateLimited {
        retry_after_secs: Some(secs),
      }) => Some(std::time::Duration::from_secs(*secs)),
      _ => None,
    }
  }
}

pub type Result<T> = std::result::Result<T, Error>;
