use std::collections::BTreeMap;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::event::{Event, EventId, EventKind, PubKey, Timestamp};

/// A subscription filter (§3, §4.B): a conjunction of optional clauses. An
/// event matches a filter iff every clause present on the filter matches.
///
/// Tag clauses (`#e`, `#p`, `#t`, ...) are open-ended — any single-letter
/// tag name can appear — so unlike the well-known `ids`/`authors`/`kinds`
/// fields they are modeled as a map rather than dedicated struct fields.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Filter {
  pub ids: Option<Vec<EventId>>,
  pub authors: Option<Vec<PubKey>>,
  pub kinds: Option<Vec<EventKind>>,
  pub since: Option<Timestamp>,
  pub until: Option<Timestamp>,
  pub limit: Option<u64>,
  /// NIP-50 advisory full text search.
  pub search: Option<String>,
  /// Keyed by the bare tag letter (`"e"`, `"p"`, `"t"`, ...), not `"#e"`.
  pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_ids(mut self, ids: Vec<EventId>) -> Self {
    self.ids = Some(ids);
    self
  }

  pub fn with_authors(mut self, authors: Vec<PubKey>) -> Self {
    self.authors = Some(authors);
    self
  }

  pub fn with_kinds(mut self, kinds: Vec<EventKind>) -> Self {
    self.kinds = Some(kinds);
    self
  }

  pub fn with_since(mut self, since: Timestamp) -> Self {
    self.since = Some(since);
    self
  }

  pub fn with_until(mut self, until: Timestamp) -> Self {
    self.until = Some(until);
    self
  }

  pub fn with_limit(mut self, limit: u64) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn with_search(mut self, search: impl Into<String>) -> Self {
    self.search = Some(search.into());
    self
  }

  pub fn with_tag(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
    self.tags.insert(name.into(), values);
    self
  }

  /// True if this filter has no `ids`, `authors`, or `kinds` clauses and
  /// therefore never specifies concrete identities — used by the
  /// SubscriptionManager's merge eligibility test (§4.F).
  pub fn has_no_identity_clauses(&self) -> bool {
    self.ids.is_none() && self.authors.is_none()
  }

  pub fn as_value(&self) -> Value {
    let mut map = Map::new();
    if let Some(ids) = &self.ids {
      map.insert("ids".into(), serde_json::json!(ids));
    }
    if let Some(authors) = &self.authors {
      map.insert("authors".into(), serde_json::json!(authors));
    }
    if let Some(kinds) = &self.kinds {
      map.insert("kinds".into(), serde_json::json!(kinds));
    }
    if let Some(since) = self.since {
      map.insert("since".into(), serde_json::json!(since));
    }
    if let Some(until) = self.until {
      map.insert("until".into(), serde_json::json!(until));
    }
    if let Some(limit) = self.limit {
      map.insert("limit".into(), serde_json::json!(limit));
    }
    if let Some(search) = &self.search {
      map.insert("search".into(), serde_json::json!(search));
    }
    for (name, values) in &self.tags {
      map.insert(format!("#{name}"), serde_json::json!(values));
    }
    Value::Object(map)
  }

  pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
    let map = value
      .as_object()
      .ok_or_else(|| serde::de::Error::custom("filter must be a JSON object"))?;

    let mut filter = Filter::default();
    for (key, value) in map {
      match key.as_str() {
        "ids" => filter.ids = Some(serde_json::from_value(value.clone())?),
        "authors" => filter.authors = Some(serde_json::from_value(value.clone())?),
        "kinds" => filter.kinds = Some(serde_json::from_value(value.clone())?),
        "since" => filter.since = Some(serde_json::from_value(value.clone())?),
        "until" => filter.until = Some(serde_json::from_value(value.clone())?),
        "limit" => filter.limit = Some(serde_json::from_value(value.clone())?),
        "search" => filter.search = Some(serde_json::from_value(value.clone())?),
        k if k.starts_with('#') && k.len() >= 2 => {
          let name = k[1..].to_string();
          let values: Vec<String> = serde_json::from_value(value.clone())?;
          filter.tags.insert(name, values);
        }
        _ => {}
      }
    }
    Ok(filter)
  }

  pub fn as_json(&self) -> String {
    self.as_value().to_string()
  }

  pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
    let value: Value = serde_json::from_str(data)?;
    Self::from_value(&value)
  }
}

impl Serialize for Filter {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    self.as_value().serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for Filter {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let value = Value::deserialize(deserializer)?;
    Filter::from_value(&value).map_err(serde::de::Error::custom)
  }
}

/// Pure matching function (§4.B). Short-circuits on the earliest-failing
/// clause. An absent clause always matches.
pub fn matches(event: &Event, filter: &Filter) -> bool {
  if let Some(ids) = &filter.ids {
    if !ids.iter().any(|id| id.as_str() == event.id) {
      return false;
    }
  }

  if let Some(authors) = &filter.authors {
    if !authors.iter().any(|author| *author == event.pubkey) {
      return false;
    }
  }

  if let Some(kinds) = &filter.kinds {
    if !kinds.iter().any(|kind| *kind == event.kind) {
      return false;
    }
  }

  if let Some(since) = filter.since {
    if event.created_at < since {
      return false;
    }
  }

  if let Some(until) = filter.until {
    if event.created_at > until {
      return false;
    }
  }

  for (name, allowed) in &filter.tags {
    let has_match = event
      .tags
      .iter()
      .filter(|t| t.name() == Some(name.as_str()))
      .any(|t| t.first_value().is_some_and(|v| allowed.iter().any(|a| a == v)));
    if !has_match {
      return false;
    }
  }

  true
}

/// NIP-50 advisory search: case-insensitive substring match on `content`.
/// Only the cache is required to evaluate this (§4.B); the wire filter
/// carries it through unevaluated to relays that support NIP-50.
pub fn matches_search(event: &Event, search: &str) -> bool {
  event.content.to_lowercase().contains(&search.to_lowercase())
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  fn event_with(kind: EventKind, tags: Vec<crate::event::Tag>, content: &str) -> Event {
    Event {
      id: "aa".to_string(),
      pubkey: "pk1".to_string(),
      kind,
      tags,
      content: content.to_string(),
      ..Default::default()
    }
  }

  #[test]
  fn s1_filter_match_from_spec() {
    // S1. Filter match.
    let event = event_with(EventKind::Text, vec![crate::event::Tag::new(["t", "nostr"])], "hi");

    let matching = Filter::new()
      .with_kinds(vec![EventKind::Text])
      .with_tag("t", vec!["nostr".to_string()]);
    assert!(matches(&event, &matching));

    let non_matching = Filter::new().with_kinds(vec![EventKind::Custom(7)]);
    assert!(!matches(&event, &non_matching));
  }

  #[test]
  fn empty_filter_matches_everything() {
    let event = event_with(EventKind::Text, vec![], "anything");
    assert!(matches(&event, &Filter::default()));
  }

  #[test]
  fn since_until_boundary_is_inclusive() {
    let event = event_with(EventKind::Text, vec![], "x");
    let mut event = event;
    event.created_at = 100;

    assert!(matches(&event, &Filter::new().with_since(100).with_until(100)));
    assert!(!matches(&event, &Filter::new().with_since(101)));
    assert!(!matches(&event, &Filter::new().with_until(99)));
  }

  #[test]
  fn past_until_before_future_since_has_no_overlap() {
    let event = event_with(EventKind::Text, vec![], "x");
    let mut event = event;
    event.created_at = 50;
    // until < since: nothing can satisfy both
    let filter = Filter::new().with_since(100).with_until(10);
    assert!(!matches(&event, &filter));
  }

  #[test]
  fn tag_clause_matches_any_value_in_set() {
    let event = event_with(EventKind::Text, vec![crate::event::Tag::new(["p", "pk2"])], "x");
    assert!(matches(
      &event,
      &Filter::new().with_tag("p", vec!["pk1".to_string(), "pk2".to_string()])
    ));
    assert!(!matches(&event, &Filter::new().with_tag("p", vec!["pk9".to_string()])));
  }

  #[test]
  fn search_is_case_insensitive_substring() {
    let event = event_with(EventKind::Text, vec![], "Hello Nostr World");
    assert!(matches_search(&event, "nostr"));
    assert!(!matches_search(&event, "bitcoin"));
  }

  #[test]
  fn round_trips_hash_tag_json_key() {
    let filter = Filter::new()
      .with_kinds(vec![EventKind::Text, EventKind::Custom(6)])
      .with_tag("e", vec!["abc".to_string()]);

    let json = filter.as_json();
    assert!(json.contains("\"#e\""));

    let back = Filter::from_json(&json).unwrap();
    assert_eq!(back, filter);
  }

  #[test]
  fn merge_eligibility_helper_reflects_identity_clauses() {
    assert!(Filter::new().with_kinds(vec![EventKind::Text]).has_no_identity_clauses());
    assert!(!Filter::new().with_ids(vec![EventId::new("x")]).has_no_identity_clauses());
  }
}
