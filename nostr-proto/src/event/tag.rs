use std::fmt;

use serde::de::{Deserialize, Deserializer, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeSeq, Serializer};

/// One entry of an event's `tags` array.
///
/// The wire format is a JSON array of strings, first element being the tag
/// name (`"e"`, `"p"`, or any application-defined letter/word). The teacher's
/// `nostr-sdk::event::tag` models `e`/`p` as a closed `Tag::Event`/`Tag::PubKey`
/// enum; the filter language in §3/§4.B needs to match on *arbitrary*
/// single-letter tag names (`"#t"`, `"#d"`, ...), so this keeps the teacher's
/// dedicated-type approach but generalizes the shape to a plain ordered list
/// of strings with name/value accessors instead of a closed enum.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
  pub fn new<I, S>(values: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self(values.into_iter().map(Into::into).collect())
  }

  pub fn event(id: impl Into<String>) -> Self {
    Self(vec!["e".to_string(), id.into()])
  }

  pub fn pubkey(pubkey: impl Into<String>) -> Self {
    Self(vec!["p".to_string(), pubkey.into()])
  }

  /// First element: the tag name (`"e"`, `"p"`, ...). Empty tags have no name.
  pub fn name(&self) -> Option<&str> {
    self.0.first().map(String::as_str)
  }

  /// Everything after the name.
  pub fn values(&self) -> &[String] {
    if self.0.is_empty() {
      &[]
    } else {
      &self.0[1..]
    }
  }

  /// The first value after the name, which is what filter clauses match
  /// against for single-letter tags (`e`, `p`, and friends).
  pub fn first_value(&self) -> Option<&str> {
    self.values().first().map(String::as_str)
  }
}

impl Serialize for Tag {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
    for v in &self.0 {
      seq.serialize_element(v)?;
    }
    seq.end()
  }
}

impl<'de> Deserialize<'de> for Tag {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct TagVisitor;

    impl<'de> Visitor<'de> for TagVisitor {
      type Value = Tag;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of strings")
      }

      fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
      where
        A: SeqAccess<'de>,
      {
        let mut values = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(v) = seq.next_element::<String>()? {
          values.push(v);
        }
        Ok(Tag(values))
      }
    }

    deserializer.deserialize_seq(TagVisitor)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn event_and_pubkey_tag_helpers() {
    let e = Tag::event("abc");
    assert_eq!(e.name(), Some("e"));
    assert_eq!(e.first_value(), Some("abc"));

    let p = Tag::pubkey("def");
    assert_eq!(p.name(), Some("p"));
    assert_eq!(p.first_value(), Some("def"));
  }

  #[test]
  fn round_trips_through_json_array() {
    let tag = Tag::new(["e", "abc", "wss://relay.example", "root"]);
    let json = serde_json::to_string(&tag).unwrap();
    assert_eq!(json, r#"["e","abc","wss://relay.example","root"]"#);

    let back: Tag = serde_json::from_str(&json).unwrap();
    assert_eq!(back, tag);
  }

  #[test]
  fn empty_tag_has_no_name_or_values() {
    let tag = Tag::default();
    assert_eq!(tag.name(), None);
    assert!(tag.values().is_empty());
  }
}
