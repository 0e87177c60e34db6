//! NIP-11 relay information document (§4.E "NIP-11 discovery", §6). On
//! each successful connection the pool fetches this over HTTPS, derived
//! by rewriting `ws(s)://` to `http(s)://`; failure is non-fatal.
//! Grounded in the shape of `other_examples`' `nip11.rs` from rust-nostr,
//! trimmed to the fields §6 enumerates.

use serde::{Deserialize, Serialize};

use crate::error::{Error, TransportError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Limitation {
  pub max_message_length: Option<i64>,
  pub max_subscriptions: Option<i64>,
  pub max_filters: Option<i64>,
  pub max_limit: Option<i64>,
  pub max_event_tags: Option<i64>,
  pub max_content_length: Option<i64>,
  pub min_pow_difficulty: Option<i64>,
  pub auth_required: Option<bool>,
  pub payment_required: Option<bool>,
  pub created_at_lower_limit: Option<i64>,
  pub created_at_upper_limit: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayInfo {
  pub name: Option<String>,
  pub description: Option<String>,
  pub pubkey: Option<String>,
  pub contact: Option<String>,
  pub supported_nips: Option<Vec<u32>>,
  pub software: Option<String>,
  pub version: Option<String>,
  pub limitation: Option<Limitation>,
}

/// Rewrites a relay's `ws(s)://` url to the matching `http(s)://` url
/// NIP-11 is fetched over.
pub fn to_http_url(relay_url: &str) -> crate::Result<String> {
  if let Some(rest) = relay_url.strip_prefix("wss://") {
    Ok(format!("https://{rest}"))
  } else if let Some(rest) = relay_url.strip_prefix("ws://") {
    Ok(format!("http://{rest}"))
  } else {
    Err(Error::Transport(TransportError::InvalidUrl(relay_url.to_string())))
  }
}

pub async fn fetch(client: &reqwest::Client, relay_url: &str) -> crate::Result<RelayInfo> {
  let http_url = to_http_url(relay_url)?;
  let response = client
    .get(http_url)
    .header("Accept", "application/nostr+json")
    .send()
    .await
    .map_err(|e| Error::Transport(TransportError::SocketClosed(e.to_string())))?;

  response
    .json::<RelayInfo>()
    .await
    .map_err(|e| Error::Transport(TransportError::SocketClosed(e.to_string())))
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn rewrites_wss_and_ws_schemes() {
    assert_eq!(to_http_url("wss://relay.example.com").unwrap(), "https://relay.example.com");
    assert_eq!(to_http_url("ws://localhost:8080").unwrap(), "http://localhost:8080");
  }

  #[test]
  fn rejects_non_websocket_schemes() {
    assert!(to_http_url("https://relay.example.com").is_err());
  }
}
