//! NIP-47 wallet-service overlay (§4.G): pairs via `nostr+walletconnect://`,
//! issues wallet RPC calls (`pay_invoice`, `get_balance`, `get_info`, ...),
//! and dispatches unsolicited notifications.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nostr_proto::{EventKind, Filter, RpcValue};
use tokio::sync::mpsc;

use crate::crypto::Crypto;
use crate::error::{Error, OverlayError};
use crate::overlay::rpc::RpcChannel;
use crate::overlay::uri::{parse_walletconnect, WalletConnectUri};
use crate::pool::{PoolSubscriptionEvent, RelayPool};

pub struct WalletNotification {
  pub notification_type: String,
  pub payload: RpcValue,
}

pub struct WalletClient {
  channel: RpcChannel,
  wallet_pubkey: String,
  lud16: Option<String>,
}

impl WalletClient {
  /// Parses a `nostr+walletconnect://` uri, adds its relays to the pool,
  /// and wires up a client keypair from the uri's `secret`.
  pub async fn connect(
    pool: Arc<RelayPool>,
    crypto: Arc<dyn Crypto>,
    uri: &str,
    requests_per_minute: u32,
    request_timeout: Duration,
  ) -> crate::Result<Self> {
    let WalletConnectUri {
      wallet_pubkey,
      relays,
      secret,
      lud16,
    } = parse_walletconnect(uri)?;

    for url in &relays {
      pool.add(url.clone(), crate::pool::RelayMetadata::default()).await?;
      let _ = pool.connect(url).await;
    }

    let client_secret: [u8; 32] = hex::decode(&secret)
      .ok()
      .and_then(|v| v.try_into().ok())
      .ok_or_else(|| Error::Overlay(OverlayError::UnsupportedMethod("malformed secret".to_string())))?;
    let client_pubkey = hex::encode(crypto.x_only_public_key(&client_secret)?);

    let channel = RpcChannel::new(pool, crypto, client_secret, client_pubkey, requests_per_minute, request_timeout);
    Ok(Self {
      channel,
      wallet_pubkey,
      lud16,
    })
  }

  pub fn lud16(&self) -> Option<&str> {
    self.lud16.as_deref()
  }

  async fn call(&self, method: &str, params: RpcValue) -> crate::Result<RpcValue> {
    self
      .channel
      .call(&self.wallet_pubkey, EventKind::WalletRequest, EventKind::WalletResponse, method, params)
      .await
  }

  pub async fn get_info(&self) -> crate::Result<RpcValue> {
    self.call("get_info", RpcValue::Object(BTreeMap::new())).await
  }

  pub async fn get_balance(&self) -> crate::Result<i64> {
    let result = self.call("get_balance", RpcValue::Object(BTreeMap::new())).await?;
    result
      .as_object()
      .and_then(|obj| obj.get("balance"))
      .and_then(|v| if let RpcValue::Int(n) = v { Some(*n) } else { None })
      .ok_or(Error::Overlay(OverlayError::DecryptionFailure))
  }

  pub async fn pay_invoice(&self, invoice: &str) -> crate::Result<String> {
    let mut params = BTreeMap::new();
    params.insert("invoice".to_string(), RpcValue::String(invoice.to_string()));
    let result = self.call("pay_invoice", RpcValue::Object(params)).await?;
    result
      .as_object()
      .and_then(|obj| obj.get("preimage"))
      .and_then(RpcValue::as_str)
      .map(str::to_string)
      .ok_or(Error::Overlay(OverlayError::DecryptionFailure))
  }

  /// Subscribes to unsolicited wallet notifications (§4.G step 4),
  /// decrypting and forwarding each to the returned channel until the
  /// subscription is closed or the pool shuts down.
  pub fn subscribe_notifications(&self) -> crate::Result<mpsc::UnboundedReceiver<WalletNotification>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = Arc::clone(self.channel.pool());
    let crypto = Arc::clone(self.channel.crypto());
    let client_secret = *self.channel.client_secret();
    let client_pubkey = self.channel.client_pubkey().to_string();
    let wallet_pubkey = self.wallet_pubkey.clone();

    tokio::spawn(async move {
      let filters = vec![Filter::new()
        .with_authors(vec![wallet_pubkey.clone()])
        .with_kinds(vec![EventKind::WalletNotification])
        .with_tag("p", vec![client_pubkey])];
      let Ok(mut pool_sub) = pool.subscribe(filters, None).await else { return };

      let shared_secret = match crypto.ecdh(
        &client_secret,
        &match hex::decode(&wallet_pubkey).ok().and_then(|v| v.try_into().ok()) {
          Some(bytes) => bytes,
          None => return,
        },
      ) {
        Ok(secret) => secret,
        Err(_) => return,
      };

      loop {
        match pool_sub.recv().await {
          Some(PoolSubscriptionEvent::Event(event)) => {
            let Ok(plaintext) = crypto.decrypt_nip44(&shared_secret, &event.content) else { continue };
            let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&plaintext) else { continue };
            let notification_type = parsed.get("notification_type").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
            let Some(notification) = parsed.get("notification") else { continue };
            let Ok(payload) = serde_json::from_value::<RpcValue>(notification.clone()) else { continue };
            if tx.send(WalletNotification { notification_type, payload }).is_err() {
              break;
            }
          }
          Some(PoolSubscriptionEvent::Eose) => continue,
          Some(PoolSubscriptionEvent::Closed(_)) | None => break,
        }
      }
    });

    Ok(rx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn pay_invoice_extracts_preimage_from_object_result() {
    let mut obj = BTreeMap::new();
    obj.insert("preimage".to_string(), RpcValue::String("feedface".to_string()));
    let value = RpcValue::Object(obj);
    assert_eq!(value.as_object().unwrap().get("preimage").unwrap().as_str(), Some("feedface"));
  }
}
