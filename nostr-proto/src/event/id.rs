use serde::{Deserialize, Serialize};

use super::kind::EventKind;
use super::tag::Tag;
use super::{PubKey, Timestamp};

/// 32-byte lowercase-hex event id.
///
/// Computing the id requires hashing (SHA-256), which this crate treats as
/// a cryptographic primitive supplied externally (see `Crypto` in
/// `nostr-client-core`). What belongs here is the *canonical preimage* the
/// hash is taken over — a pure, deterministic function of the other event
/// fields, per NIP-01 and §3 of the spec.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub String);

impl EventId {
  pub fn new(hex: impl Into<String>) -> Self {
    Self(hex.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<String> for EventId {
  fn from(value: String) -> Self {
    Self(value)
  }
}

impl AsRef<str> for EventId {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

/// Builds the exact byte string that must be SHA-256 hashed to produce an
/// event's id: `[0, pubkey, created_at, kind, tags, content]`, UTF-8, with
/// no escaped forward slashes (serde_json never escapes them) and no
/// insignificant whitespace.
///
/// This is the "canonical form" referenced throughout §3/§4.A. It lives in
/// the proto crate because it is pure data shaping; the actual hashing is a
/// `Crypto` concern.
pub fn canonical_preimage(
  pubkey: &PubKey,
  created_at: Timestamp,
  kind: EventKind,
  tags: &[Tag],
  content: &str,
) -> Vec<u8> {
  let value = serde_json::json!([0, pubkey, created_at, kind.as_u64(), tags, content]);
  // `serde_json::Value::to_string` is compact and never escapes `/`.
  value.to_string().into_bytes()
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn canonical_preimage_matches_nip01_shape() {
    let pubkey = "pk1".to_string();
    let tags = vec![Tag::event("eid")];
    let preimage = canonical_preimage(&pubkey, 1673002822, EventKind::Text, &tags, "hi");
    let as_str = String::from_utf8(preimage).unwrap();

    assert_eq!(as_str, r#"[0,"pk1",1673002822,1,[["e","eid"]],"hi"]"#);
  }

  #[test]
  fn canonical_preimage_is_deterministic() {
    let pubkey = "pk1".to_string();
    let tags = vec![];
    let a = canonical_preimage(&pubkey, 5, EventKind::Text, &tags, "x");
    let b = canonical_preimage(&pubkey, 5, EventKind::Text, &tags, "x");
    assert_eq!(a, b);
  }

  #[test]
  fn canonical_preimage_never_escapes_forward_slashes() {
    let pubkey = "pk1".to_string();
    let tags = vec![];
    let preimage = canonical_preimage(&pubkey, 1, EventKind::Text, &tags, "https://relay/x");
    let as_str = String::from_utf8(preimage).unwrap();
    assert!(as_str.contains("https://relay/x"));
    assert!(!as_str.contains(r"\/"));
  }
}
