//! NIP-46/NIP-47 connection URIs (§6): `bunker://`, `nostrconnect://`,
//! `nostr+walletconnect://`. Parsed by hand rather than through the `url`
//! crate's authority parser since the "host" position here is always a
//! bare hex pubkey, not a DNS name, and `relay` may repeat.

use crate::error::{Error, OverlayError};

#[derive(Debug, Clone, PartialEq)]
pub struct BunkerUri {
  pub signer_pubkey: String,
  pub relays: Vec<String>,
  pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NostrConnectUri {
  pub client_pubkey: String,
  pub relays: Vec<String>,
  pub secret: Option<String>,
  pub perms: Vec<String>,
  pub name: Option<String>,
  pub url: Option<String>,
  pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalletConnectUri {
  pub wallet_pubkey: String,
  pub relays: Vec<String>,
  pub secret: String,
  pub lud16: Option<String>,
}

fn split_authority_and_query(uri: &str, scheme: &str) -> crate::Result<(String, Vec<(String, String)>)> {
  let rest = uri
    .strip_prefix(scheme)
    .ok_or_else(|| Error::Overlay(OverlayError::UnsupportedMethod(format!("not a {scheme} uri"))))?;
  let (authority, query) = rest.split_once('?').unwrap_or((rest, ""));
  if authority.is_empty() {
    return Err(Error::Overlay(OverlayError::UnsupportedMethod("missing pubkey".to_string())));
  }
  let pairs = query
    .split('&')
    .filter(|s| !s.is_empty())
    .filter_map(|pair| pair.split_once('='))
    .map(|(k, v)| (k.to_string(), urlencoding_decode(v)))
    .collect();
  Ok((authority.to_string(), pairs))
}

/// Minimal percent-decoding; query values here are relay URLs and short
/// opaque tokens, never multi-byte percent sequences in practice.
fn urlencoding_decode(value: &str) -> String {
  value.replace("%3A", ":").replace("%2F", "/").replace("%40", "@")
}

pub fn parse_bunker(uri: &str) -> crate::Result<BunkerUri> {
  let (pubkey, pairs) = split_authority_and_query(uri, "bunker://")?;
  let mut relays = Vec::new();
  let mut secret = None;
  for (key, value) in pairs {
    match key.as_str() {
      "relay" => relays.push(value),
      "secret" => secret = Some(value),
      _ => {}
    }
  }
  Ok(BunkerUri {
    signer_pubkey: pubkey,
    relays,
    secret,
  })
}

pub fn parse_nostrconnect(uri: &str) -> crate::Result<NostrConnectUri> {
  let (pubkey, pairs) = split_authority_and_query(uri, "nostrconnect://")?;
  let mut relays = Vec::new();
  let mut secret = None;
  let mut perms = Vec::new();
  let mut name = None;
  let mut url = None;
  let mut image = None;
  for (key, value) in pairs {
    match key.as_str() {
      "relay" => relays.push(value),
      "secret" => secret = Some(value),
      "perms" => perms = value.split(',').map(str::to_string).collect(),
      "name" => name = Some(value),
      "url" => url = Some(value),
      "image" => image = Some(value),
      _ => {}
    }
  }
  Ok(NostrConnectUri {
    client_pubkey: pubkey,
    relays,
    secret,
    perms,
    name,
    url,
    image,
  })
}

pub fn parse_walletconnect(uri: &str) -> crate::Result<WalletConnectUri> {
  let (pubkey, pairs) = split_authority_and_query(uri, "nostr+walletconnect://")?;
  let mut relays = Vec::new();
  let mut secret = None;
  let mut lud16 = None;
  for (key, value) in pairs {
    match key.as_str() {
      "relay" => relays.push(value),
      "secret" => secret = Some(value),
      "lud16" => lud16 = Some(value),
      _ => {}
    }
  }
  Ok(WalletConnectUri {
    wallet_pubkey: pubkey,
    relays,
    secret: secret.ok_or_else(|| Error::Overlay(OverlayError::UnsupportedMethod("missing secret".to_string())))?,
    lud16,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn parses_bunker_uri_with_repeated_relay_params() {
    let uri = "bunker://abc123?relay=wss://relay1.example.com&relay=wss://relay2.example.com&secret=deadbeef";
    let parsed = parse_bunker(uri).unwrap();
    assert_eq!(parsed.signer_pubkey, "abc123");
    assert_eq!(parsed.relays, vec!["wss://relay1.example.com", "wss://relay2.example.com"]);
    assert_eq!(parsed.secret.as_deref(), Some("deadbeef"));
  }

  #[test]
  fn parses_nostrconnect_uri_with_perms_csv() {
    let uri = "nostrconnect://clientpub?relay=wss://relay.example.com&secret=xyz&perms=sign_event,get_public_key&name=MyApp";
    let parsed = parse_nostrconnect(uri).unwrap();
    assert_eq!(parsed.client_pubkey, "clientpub");
    assert_eq!(parsed.perms, vec!["sign_event", "get_public_key"]);
    assert_eq!(parsed.name.as_deref(), Some("MyApp"));
  }

  #[test]
  fn parses_walletconnect_uri_and_requires_secret() {
    let uri = "nostr+walletconnect://walletpub?relay=wss://relay.example.com&secret=sec1&lud16=me@example.com";
    let parsed = parse_walletconnect(uri).unwrap();
    assert_eq!(parsed.wallet_pubkey, "walletpub");
    assert_eq!(parsed.lud16.as_deref(), Some("me@example.com"));

    let missing_secret = "nostr+walletconnect://walletpub?relay=wss://relay.example.com";
    assert!(parse_walletconnect(missing_secret).is_err());
  }
}
