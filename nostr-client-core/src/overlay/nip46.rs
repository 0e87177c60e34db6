//! NIP-46 remote signer overlay (§4.G "Connection lifecycle (NIP-46)"):
//! bunker-initiated and client-initiated pairing, `get_public_key`,
//! `sign_event`, persisted connection record, and reconnection with
//! backoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nostr_proto::{Event, EventKind, Filter, RpcValue};
use serde::{Deserialize, Serialize};

use crate::config::ResilienceConfig;
use crate::connection::backoff_delay;
use crate::crypto::Crypto;
use crate::error::{Error, OverlayError};
use crate::overlay::rpc::RpcChannel;
use crate::overlay::uri::{parse_bunker, BunkerUri};
use crate::pool::{PoolSubscriptionEvent, RelayPool};
use crate::secret_store::{Protection, SecretStore};

const SUBSYSTEM: &str = "nip46";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSignerConnection {
  pub signer_pubkey: String,
  pub relays: Vec<String>,
  pub secret: Option<String>,
  pub user_pubkey: Option<String>,
}

pub struct RemoteSignerClient {
  channel: RpcChannel,
  secret_store: Arc<dyn SecretStore>,
  connection: std::sync::Mutex<RemoteSignerConnection>,
  reconnect_failures: AtomicU32,
}

impl RemoteSignerClient {
  fn persist(&self, connection: &RemoteSignerConnection) {
    let Ok(json) = serde_json::to_vec(connection) else { return };
    let _ = self.secret_store.put(&format!("{SUBSYSTEM}.connection"), &json, Protection::UnlockRequired);
  }

  fn persist_client_keypair(secret_store: &dyn SecretStore, secret: &[u8; 32]) {
    let _ = secret_store.put(&format!("{SUBSYSTEM}.client_keypair"), secret, Protection::UnlockRequired);
  }

  fn load_or_generate_client_secret(secret_store: &dyn SecretStore, crypto: &dyn Crypto) -> [u8; 32] {
    if let Ok(Some(bytes)) = secret_store.get(&format!("{SUBSYSTEM}.client_keypair")) {
      if let Ok(secret) = bytes.try_into() {
        return secret;
      }
    }
    let secret = crypto.generate_secret_key();
    Self::persist_client_keypair(secret_store, &secret);
    secret
  }

  /// Pairs with a signer that already published its `bunker://` uri
  /// (§4.G "Bunker-initiated"): adds its relays, subscribes for
  /// responses, sends `connect(secret)`, then fetches the user pubkey.
  pub async fn connect_bunker(
    pool: Arc<RelayPool>,
    crypto: Arc<dyn Crypto>,
    secret_store: Arc<dyn SecretStore>,
    uri: &str,
    requests_per_minute: u32,
    request_timeout: Duration,
  ) -> crate::Result<Arc<Self>> {
    let BunkerUri {
      signer_pubkey,
      relays,
      secret,
    } = parse_bunker(uri)?;

    for url in &relays {
      pool.add(url.clone(), crate::pool::RelayMetadata::default()).await?;
      let _ = pool.connect(url).await;
    }

    let client_secret = Self::load_or_generate_client_secret(secret_store.as_ref(), crypto.as_ref());
    let client_pubkey = hex::encode(crypto.x_only_public_key(&client_secret)?);
    let channel = RpcChannel::new(pool, crypto, client_secret, client_pubkey, requests_per_minute, request_timeout);

    let connect_params = match &secret {
      Some(secret) => RpcValue::Array(vec![RpcValue::String(signer_pubkey.clone()), RpcValue::String(secret.clone())]),
      None => RpcValue::Array(vec![RpcValue::String(signer_pubkey.clone())]),
    };
    channel
      .call(&signer_pubkey, EventKind::NostrConnect, EventKind::NostrConnect, "connect", connect_params)
      .await?;

    let user_pubkey = channel
      .call(&signer_pubkey, EventKind::NostrConnect, EventKind::NostrConnect, "get_public_key", RpcValue::Array(vec![]))
      .await?
      .as_str()
      .map(str::to_string);

    let connection = RemoteSignerConnection {
      signer_pubkey,
      relays,
      secret,
      user_pubkey,
    };
    let client = Arc::new(Self {
      channel,
      secret_store,
      connection: std::sync::Mutex::new(connection.clone()),
      reconnect_failures: AtomicU32::new(0),
    });
    client.persist(&connection);
    Ok(client)
  }

  /// Generates a pairing uri and waits for an incoming connect response
  /// (§4.G "Client-initiated"). The caller is responsible for getting
  /// `uri` to the signer (QR code, deep link, ...).
  pub async fn connect_client_initiated(
    pool: Arc<RelayPool>,
    crypto: Arc<dyn Crypto>,
    secret_store: Arc<dyn SecretStore>,
    relays: Vec<String>,
    app_name: &str,
    requests_per_minute: u32,
    request_timeout: Duration,
  ) -> crate::Result<(String, Arc<Self>)> {
    for url in &relays {
      pool.add(url.clone(), crate::pool::RelayMetadata::default()).await?;
      let _ = pool.connect(url).await;
    }

    let client_secret = Self::load_or_generate_client_secret(secret_store.as_ref(), crypto.as_ref());
    let client_pubkey = hex::encode(crypto.x_only_public_key(&client_secret)?);
    let secret_token = hex::encode(crypto.generate_secret_key());

    let relay_params = relays.iter().map(|r| format!("relay={r}")).collect::<Vec<_>>().join("&");
    let uri = format!("nostrconnect://{client_pubkey}?{relay_params}&secret={secret_token}&name={app_name}");

    let filters = vec![Filter::new()
      .with_kinds(vec![EventKind::NostrConnect])
      .with_tag("p", vec![client_pubkey.clone()])];
    let mut pool_sub = pool.subscribe(filters, None).await?;

    let channel = RpcChannel::new(
      Arc::clone(&pool),
      Arc::clone(&crypto),
      client_secret,
      client_pubkey,
      requests_per_minute,
      request_timeout,
    );

    let signer_pubkey = tokio::time::timeout(request_timeout, async {
      loop {
        match pool_sub.recv().await {
          Some(PoolSubscriptionEvent::Event(event)) => {
            let Ok(shared_secret) = channel.shared_secret(&event.pubkey) else { continue };
            let Ok(plaintext) = channel.decrypt(&shared_secret, &event.content) else { continue };
            let Ok(response) = crate::overlay::rpc::RpcResponse::from_json(&plaintext) else { continue };
            let matches_ack = response
              .result
              .as_ref()
              .and_then(RpcValue::as_str)
              .is_some_and(|r| r == "ack" || r == secret_token);
            if matches_ack {
              return Some(event.pubkey.clone());
            }
          }
          Some(PoolSubscriptionEvent::Eose) => continue,
          Some(PoolSubscriptionEvent::Closed(_)) | None => return None,
        }
      }
    })
    .await
    .ok()
    .flatten()
    .ok_or(Error::Overlay(OverlayError::Timeout))?;

    pool.close_subscription(pool_sub.id()).await;

    let user_pubkey = channel
      .call(&signer_pubkey, EventKind::NostrConnect, EventKind::NostrConnect, "get_public_key", RpcValue::Array(vec![]))
      .await?
      .as_str()
      .map(str::to_string);

    let connection = RemoteSignerConnection {
      signer_pubkey,
      relays,
      secret: Some(secret_token),
      user_pubkey,
    };
    let client = Arc::new(Self {
      channel,
      secret_store,
      connection: std::sync::Mutex::new(connection.clone()),
      reconnect_failures: AtomicU32::new(0),
    });
    client.persist(&connection);
    Ok((uri, client))
  }

  pub fn connection(&self) -> RemoteSignerConnection {
    self.connection.lock().expect("connection mutex poisoned").clone()
  }

  pub async fn get_public_key(&self) -> crate::Result<String> {
    let signer_pubkey = self.connection().signer_pubkey;
    let result = self
      .channel
      .call(&signer_pubkey, EventKind::NostrConnect, EventKind::NostrConnect, "get_public_key", RpcValue::Array(vec![]))
      .await?;
    result.as_str().map(str::to_string).ok_or(Error::Overlay(OverlayError::DecryptionFailure))
  }

  pub async fn sign_event(&self, unsigned: &Event) -> crate::Result<Event> {
    let signer_pubkey = self.connection().signer_pubkey;
    let params = RpcValue::Array(vec![RpcValue::String(unsigned.as_json())]);
    let result = self
      .channel
      .call(&signer_pubkey, EventKind::NostrConnect, EventKind::NostrConnect, "sign_event", params)
      .await?;
    let json = result.as_str().ok_or(Error::Overlay(OverlayError::DecryptionFailure))?;
    Event::from_json(json).map_err(|_| Error::Overlay(OverlayError::DecryptionFailure))
  }

  /// Exponential backoff reconnect: re-adds every relay, then sends a
  /// `ping` expecting `pong`; success resets the failure counter (§4.G
  /// "Auto-reconnection").
  pub async fn reconnect(&self, resilience: &ResilienceConfig) -> crate::Result<()> {
    let connection = self.connection();
    for url in &connection.relays {
      let _ = self.channel.pool().connect(url).await;
    }

    let signer_pubkey = connection.signer_pubkey.clone();
    let result = self
      .channel
      .call(&signer_pubkey, EventKind::NostrConnect, EventKind::NostrConnect, "ping", RpcValue::Array(vec![]))
      .await;

    match result {
      Ok(value) if value.as_str() == Some("pong") => {
        self.reconnect_failures.store(0, Ordering::Relaxed);
        Ok(())
      }
      _ => {
        let failures = self.reconnect_failures.fetch_add(1, Ordering::Relaxed);
        let delay = backoff_delay(resilience, failures);
        tokio::time::sleep(delay).await;
        Err(Error::Overlay(OverlayError::NoActiveConnection))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn connection_record_round_trips_through_json() {
    let connection = RemoteSignerConnection {
      signer_pubkey: "abc".to_string(),
      relays: vec!["wss://relay.example.com".to_string()],
      secret: Some("sec".to_string()),
      user_pubkey: Some("userpub".to_string()),
    };
    let json = serde_json::to_vec(&connection).unwrap();
    let back: RemoteSignerConnection = serde_json::from_slice(&json).unwrap();
    assert_eq!(back.signer_pubkey, connection.signer_pubkey);
    assert_eq!(back.user_pubkey, connection.user_pubkey);
  }
}
