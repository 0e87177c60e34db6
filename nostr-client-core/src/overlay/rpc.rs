//! Shared request/response correlation (§4.G) underlying both NIP-46 and
//! NIP-47: build and sign a correlated RPC frame, encrypt it to the
//! peer, publish, subscribe for the matching response, and resolve or
//! time out.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nostr_proto::{Event, EventKind, Filter, RpcValue, Tag};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::crypto::Crypto;
use crate::error::{Error, OverlayError};
use crate::overlay::rate_limiter::RateLimiter;
use crate::pool::{PoolSubscriptionEvent, RelayPool};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
  pub id: String,
  pub method: String,
  pub params: RpcValue,
}

impl RpcRequest {
  pub fn new(method: impl Into<String>, params: RpcValue) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      method: method.into(),
      params,
    }
  }

  pub fn to_json(&self) -> String {
    serde_json::to_string(self).expect("RpcRequest always serializes")
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<RpcValue>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl RpcResponse {
  pub fn from_json(data: &str) -> crate::Result<Self> {
    serde_json::from_str(data).map_err(|_| Error::Overlay(OverlayError::DecryptionFailure))
  }
}

/// Signs an event of the given kind/tags/content under `secret`, filling
/// in `id` and `sig` from the canonical preimage (§3 "Event").
pub fn sign_event(
  crypto: &dyn Crypto,
  secret: &[u8; 32],
  pubkey_hex: &str,
  kind: EventKind,
  tags: Vec<Tag>,
  content: String,
) -> crate::Result<Event> {
  let created_at = now_secs();
  let preimage = nostr_proto::event::id::canonical_preimage(pubkey_hex, created_at, kind, &tags, &content);
  let digest = crypto.sha256(&preimage);
  let sig = crypto.sign_schnorr(&digest, secret)?;
  Ok(Event {
    id: hex::encode(digest),
    pubkey: pubkey_hex.to_string(),
    created_at,
    kind,
    tags,
    content,
    sig: hex::encode(sig),
  })
}

fn now_secs() -> i64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .expect("system clock before unix epoch")
    .as_secs() as i64
}

/// Encrypts with NIP-44 and is able to decrypt either NIP-44 or the
/// `?iv=`-suffixed NIP-04 payloads a peer may reply with (§4.G "peer
/// indicated scheme").
fn encrypt_preferred(crypto: &dyn Crypto, shared_secret: &[u8; 32], plaintext: &str) -> crate::Result<String> {
  crypto.encrypt_nip44(shared_secret, plaintext)
}

fn decrypt_either(crypto: &dyn Crypto, shared_secret: &[u8; 32], payload: &str) -> crate::Result<String> {
  if payload.contains("?iv=") {
    crypto.decrypt_nip04(shared_secret, payload)
  } else {
    crypto.decrypt_nip44(shared_secret, payload)
  }
}

/// The capability nip46/nip47 build their higher-level flows on top of:
/// correlated send-and-wait over the pool, a shared seen-id dedup set,
/// and a rate limiter gating outbound calls.
pub struct RpcChannel {
  pool: Arc<RelayPool>,
  crypto: Arc<dyn Crypto>,
  client_secret: [u8; 32],
  client_pubkey: String,
  rate_limiter: RateLimiter,
  request_timeout: Duration,
  seen_ids: Mutex<HashSet<String>>,
}

impl RpcChannel {
  pub fn new(
    pool: Arc<RelayPool>,
    crypto: Arc<dyn Crypto>,
    client_secret: [u8; 32],
    client_pubkey: String,
    requests_per_minute: u32,
    request_timeout: Duration,
  ) -> Self {
    Self {
      pool,
      crypto,
      client_secret,
      client_pubkey,
      rate_limiter: RateLimiter::new(requests_per_minute),
      request_timeout,
      seen_ids: Mutex::new(HashSet::new()),
    }
  }

  pub fn client_pubkey(&self) -> &str {
    &self.client_pubkey
  }

  /// Builds, encrypts, publishes a request of `request_kind`, subscribes
  /// for a correlated response of `response_kind`, and waits up to
  /// `request_timeout` (§4.G steps 1-3).
  pub async fn call(
    &self,
    peer_pubkey: &str,
    request_kind: EventKind,
    response_kind: EventKind,
    method: &str,
    params: RpcValue,
  ) -> crate::Result<RpcValue> {
    self.rate_limiter.acquire().await;

    let shared_secret = self.shared_secret(peer_pubkey)?;
    let request = RpcRequest::new(method, params);
    let ciphertext = encrypt_preferred(self.crypto.as_ref(), &shared_secret, &request.to_json())?;

    let event = sign_event(
      self.crypto.as_ref(),
      &self.client_secret,
      &self.client_pubkey,
      request_kind,
      vec![Tag::new(["p", peer_pubkey.to_string()])],
      ciphertext,
    )?;

    let filters = vec![Filter::new()
      .with_authors(vec![peer_pubkey.to_string()])
      .with_kinds(vec![response_kind])
      .with_tag("p", vec![self.client_pubkey.clone()])
      .with_tag("e", vec![request.id.clone()])];
    let mut pool_sub = self.pool.subscribe(filters, None).await?;

    self.pool.publish(event, None).await;

    let result = tokio::time::timeout(self.request_timeout, self.await_response(&mut pool_sub, peer_pubkey, &shared_secret, &request.id)).await;
    self.pool.close_subscription(pool_sub.id()).await;

    match result {
      Ok(response) => response,
      Err(_) => Err(Error::Overlay(OverlayError::Timeout)),
    }
  }

  async fn await_response(
    &self,
    pool_sub: &mut crate::pool::PoolSubscription,
    peer_pubkey: &str,
    shared_secret: &[u8; 32],
    request_id: &str,
  ) -> crate::Result<RpcValue> {
    loop {
      match pool_sub.recv().await {
        Some(PoolSubscriptionEvent::Event(event)) => {
          if event.pubkey != peer_pubkey {
            continue;
          }
          {
            let mut seen = self.seen_ids.lock().await;
            if !seen.insert(event.id.clone()) {
              continue;
            }
          }
          let Ok(plaintext) = decrypt_either(self.crypto.as_ref(), shared_secret, &event.content) else {
            continue;
          };
          let Ok(response) = RpcResponse::from_json(&plaintext) else {
            continue;
          };
          if response.id != request_id {
            continue;
          }
          return match (response.result, response.error) {
            (Some(result), _) => Ok(result),
            (None, Some(message)) => Err(Error::Overlay(OverlayError::ServiceError {
              code: "error".to_string(),
              message,
            })),
            (None, None) => Ok(RpcValue::Null),
          };
        }
        Some(PoolSubscriptionEvent::Eose) => continue,
        Some(PoolSubscriptionEvent::Closed(_)) | None => {
          return Err(Error::Overlay(OverlayError::NoActiveConnection));
        }
      }
    }
  }

  pub fn shared_secret(&self, peer_pubkey_hex: &str) -> crate::Result<[u8; 32]> {
    let peer_bytes: [u8; 32] = hex::decode(peer_pubkey_hex)
      .ok()
      .and_then(|v| v.try_into().ok())
      .ok_or_else(|| Error::Overlay(OverlayError::DecryptionFailure))?;
    self.crypto.ecdh(&self.client_secret, &peer_bytes)
  }

  pub fn decrypt(&self, shared_secret: &[u8; 32], payload: &str) -> crate::Result<String> {
    decrypt_either(self.crypto.as_ref(), shared_secret, payload)
  }

  pub fn encrypt(&self, shared_secret: &[u8; 32], plaintext: &str) -> crate::Result<String> {
    encrypt_preferred(self.crypto.as_ref(), shared_secret, plaintext)
  }

  pub fn crypto(&self) -> &Arc<dyn Crypto> {
    &self.crypto
  }

  pub fn client_secret(&self) -> &[u8; 32] {
    &self.client_secret
  }

  pub fn pool(&self) -> &Arc<RelayPool> {
    &self.pool
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn request_round_trips_through_json() {
    let request = RpcRequest::new("get_public_key", RpcValue::Array(vec![]));
    let json = request.to_json();
    assert!(json.contains("get_public_key"));
  }

  #[test]
  fn response_with_error_has_no_result() {
    let response = RpcResponse {
      id: "abc".to_string(),
      result: None,
      error: Some("denied".to_string()),
    };
    let json = serde_json::to_string(&response).unwrap();
    assert!(!json.contains("\"result\""));
  }
}
