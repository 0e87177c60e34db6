use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Dynamic value union for RPC params (§9 "Dynamic values"): the overlay's
/// `{id, method, params}` frames carry heterogeneous JSON, so params are
/// modeled as a tagged union rather than a fixed struct. Encodes/decodes as
/// plain JSON with no reflection — a thin visitor over `serde_json::Value`
/// shaped types, kept separate from `serde_json::Value` itself so the
/// overlay modules don't have to depend on `serde_json` internals directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcValue {
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  String(String),
  Array(Vec<RpcValue>),
  Object(BTreeMap<String, RpcValue>),
}

impl RpcValue {
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Self::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_array(&self) -> Option<&[RpcValue]> {
    match self {
      Self::Array(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_object(&self) -> Option<&BTreeMap<String, RpcValue>> {
    match self {
      Self::Object(m) => Some(m),
      _ => None,
    }
  }
}

impl From<&str> for RpcValue {
  fn from(value: &str) -> Self {
    Self::String(value.to_string())
  }
}

impl From<String> for RpcValue {
  fn from(value: String) -> Self {
    Self::String(value)
  }
}

impl From<i64> for RpcValue {
  fn from(value: i64) -> Self {
    Self::Int(value)
  }
}

impl From<bool> for RpcValue {
  fn from(value: bool) -> Self {
    Self::Bool(value)
  }
}

impl From<Vec<RpcValue>> for RpcValue {
  fn from(value: Vec<RpcValue>) -> Self {
    Self::Array(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn round_trips_heterogeneous_array() {
    let value = RpcValue::Array(vec![
      RpcValue::String("a".into()),
      RpcValue::Int(1),
      RpcValue::Bool(true),
      RpcValue::Null,
    ]);
    let json = serde_json::to_string(&value).unwrap();
    let back: RpcValue = serde_json::from_str(&json).unwrap();
    assert_eq!(back, value);
  }

  #[test]
  fn round_trips_nested_object() {
    let mut obj = BTreeMap::new();
    obj.insert("amount".to_string(), RpcValue::Int(1000));
    obj.insert("memo".to_string(), RpcValue::String("coffee".into()));
    let value = RpcValue::Object(obj);

    let json = serde_json::to_string(&value).unwrap();
    let back: RpcValue = serde_json::from_str(&json).unwrap();
    assert_eq!(back, value);
  }
}
