use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::de::{Deserialize, Deserializer, Error as DeError, Visitor};
use serde::ser::{Serialize, Serializer};

/// Discriminator carried by every event.
///
/// Most of the protocol only cares whether a kind falls into one of a
/// handful of well-known buckets (metadata, text note, deletion, the two
/// request/response overlay kinds...); everything else round-trips through
/// `Custom` so the cache and wire codec never reject an event for carrying
/// an unrecognized kind.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
  /// NIP-01 replaceable user metadata.
  Metadata,
  /// NIP-01 plain text note.
  #[default]
  Text,
  /// NIP-01 relay recommendation.
  RecommendRelay,
  /// NIP-09 deletion request. The cache's `process_deletion` reacts to this.
  Deletion,
  /// NIP-46 remote-signer request/response frames.
  NostrConnect,
  /// NIP-47 wallet-service request frame.
  WalletRequest,
  /// NIP-47 wallet-service response frame.
  WalletResponse,
  /// NIP-47 wallet-service notification frame.
  WalletNotification,
  /// Any kind this crate has no dedicated variant for.
  Custom(u64),
}

impl EventKind {
  pub fn as_u64(&self) -> u64 {
    (*self).into()
  }

  pub fn is_deletion(&self) -> bool {
    matches!(self, Self::Deletion)
  }
}

impl From<u64> for EventKind {
  fn from(kind: u64) -> Self {
    match kind {
      0 => Self::Metadata,
      1 => Self::Text,
      2 => Self::RecommendRelay,
      5 => Self::Deletion,
      24133 => Self::NostrConnect,
      23194 => Self::WalletRequest,
      23195 => Self::WalletResponse,
      23196 => Self::WalletNotification,
      x => Self::Custom(x),
    }
  }
}

impl From<EventKind> for u64 {
  fn from(kind: EventKind) -> Self {
    match kind {
      EventKind::Metadata => 0,
      EventKind::Text => 1,
      EventKind::RecommendRelay => 2,
      EventKind::Deletion => 5,
      EventKind::NostrConnect => 24133,
      EventKind::WalletRequest => 23194,
      EventKind::WalletResponse => 23195,
      EventKind::WalletNotification => 23196,
      EventKind::Custom(x) => x,
    }
  }
}

impl FromStr for EventKind {
  type Err = ParseIntError;

  fn from_str(kind: &str) -> Result<Self, Self::Err> {
    let kind: u64 = kind.parse()?;
    Ok(Self::from(kind))
  }
}

impl fmt::Display for EventKind {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.as_u64())
  }
}

impl Serialize for EventKind {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_u64(self.as_u64())
  }
}

impl<'de> Deserialize<'de> for EventKind {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct KindVisitor;

    impl<'de> Visitor<'de> for KindVisitor {
      type Value = EventKind;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an integer event kind")
      }

      fn visit_u64<E: DeError>(self, v: u64) -> Result<Self::Value, E> {
        Ok(EventKind::from(v))
      }

      fn visit_i64<E: DeError>(self, v: i64) -> Result<Self::Value, E> {
        if v < 0 {
          return Err(E::custom("kind must be non-negative"));
        }
        Ok(EventKind::from(v as u64))
      }
    }

    deserializer.deserialize_u64(KindVisitor)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn round_trips_well_known_kinds() {
    for (n, kind) in [
      (0u64, EventKind::Metadata),
      (1, EventKind::Text),
      (2, EventKind::RecommendRelay),
      (5, EventKind::Deletion),
      (42, EventKind::Custom(42)),
    ] {
      assert_eq!(EventKind::from(n), kind);
      assert_eq!(kind.as_u64(), n);
    }
  }

  #[test]
  fn serializes_as_bare_integer() {
    let json = serde_json::to_string(&EventKind::Text).unwrap();
    assert_eq!(json, "1");
    let json = serde_json::to_string(&EventKind::Custom(9735)).unwrap();
    assert_eq!(json, "9735");
  }

  #[test]
  fn deserializes_unknown_kind_as_custom() {
    let kind: EventKind = serde_json::from_str("7").unwrap();
    assert_eq!(kind, EventKind::Custom(7));
  }
}
