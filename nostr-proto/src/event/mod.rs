use serde::{Deserialize, Serialize};

pub mod id;
pub mod kind;
pub mod tag;

pub use id::EventId;
pub use kind::EventKind;
pub use tag::Tag;

pub type PubKey = String;
pub type Timestamp = i64;

/// An immutable, signed Nostr event — the only object that exists in the
/// protocol (§3). Field names and order match the wire/persisted JSON shape
/// exactly (§6): `{id, pubkey, created_at, kind, tags, content, sig}`.
///
/// This type carries no behavior around hashing or signing: computing a
/// valid `id`/`sig` pair needs a `Crypto` implementation, which lives one
/// layer up in `nostr-client-core`. What this crate guarantees is the shape
/// and the wire encoding.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Event {
  pub id: String,
  pub pubkey: PubKey,
  pub created_at: Timestamp,
  pub kind: EventKind,
  pub tags: Vec<Tag>,
  pub content: String,
  pub sig: String,
}

impl Event {
  /// Canonical preimage `[0, pubkey, created_at, kind, tags, content]` this
  /// event's `id` must equal `hash(..)` of. See `id::canonical_preimage`.
  pub fn canonical_preimage(&self) -> Vec<u8> {
    id::canonical_preimage(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
  }

  /// Returns the value of the first tag with the given name, if any.
  pub fn tag_value(&self, name: &str) -> Option<&str> {
    self
      .tags
      .iter()
      .find(|t| t.name() == Some(name))
      .and_then(Tag::first_value)
  }

  /// All values across tags carrying the given name (order preserved).
  pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
    self
      .tags
      .iter()
      .filter(move |t| t.name() == Some(name))
      .filter_map(Tag::first_value)
  }

  pub fn as_json(&self) -> String {
    serde_json::to_string(self).expect("Event always serializes")
  }

  pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(data)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  fn sample() -> Event {
    Event {
      id: "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb".to_string(),
      pubkey: "02c7e1b1e9c175ab2d100baf1d5a66e73ecc044e9f8093d0c965741f26aa3abf76".to_string(),
      created_at: 1673002822,
      kind: EventKind::Text,
      tags: vec![
        Tag::new(["e", "688787d8ff144c502c7f5cffaafe2cc588d86079f9de88304c26b0cb99ce91c6"]),
        Tag::new(["p", "02c7e1b1e9c175ab2d100baf1d5a66e73ecc044e9f8093d0c965741f26aa3abf76"]),
      ],
      content: "Lorem ipsum dolor sit amet".to_string(),
      sig: "e8551d85f530113366e8da481354c2756605e3f58149cedc1fb9385d35251712b954af8ef891cb0467d50ddc6685063d4190c97e9e131f903e6e4176dc13ce7c".to_string(),
    }
  }

  #[test]
  fn round_trips_through_json() {
    let event = sample();
    let json = event.as_json();
    let back = Event::from_json(&json).unwrap();
    assert_eq!(event, back);
  }

  #[test]
  fn field_order_matches_wire_shape() {
    let event = sample();
    let json = event.as_json();
    let id_pos = json.find("\"id\"").unwrap();
    let pubkey_pos = json.find("\"pubkey\"").unwrap();
    let sig_pos = json.find("\"sig\"").unwrap();
    assert!(id_pos < pubkey_pos);
    assert!(pubkey_pos < sig_pos);
  }

  #[test]
  fn tag_value_finds_first_matching_tag() {
    let event = sample();
    assert_eq!(
      event.tag_value("p"),
      Some("02c7e1b1e9c175ab2d100baf1d5a66e73ecc044e9f8093d0c965741f26aa3abf76")
    );
    assert_eq!(event.tag_value("x"), None);
  }
}
