use serde_json::Value;

use super::Error;
use crate::event::Event;
use crate::filter::Filter;

/// A client→relay frame: `["EVENT", e]`, `["REQ", sub_id, f1, f2, …]`,
/// `["CLOSE", sub_id]`, or `["AUTH", e]` (NIP-42).
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
  Event(Box<Event>),
  Req {
    subscription_id: String,
    filters: Vec<Filter>,
  },
  Close {
    subscription_id: String,
  },
  Auth(Box<Event>),
}

impl ClientMessage {
  pub fn event(event: Event) -> Self {
    Self::Event(Box::new(event))
  }

  pub fn req(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
    Self::Req {
      subscription_id: subscription_id.into(),
      filters,
    }
  }

  pub fn close(subscription_id: impl Into<String>) -> Self {
    Self::Close {
      subscription_id: subscription_id.into(),
    }
  }

  pub fn auth(event: Event) -> Self {
    Self::Auth(Box::new(event))
  }

  pub fn as_value(&self) -> Value {
    match self {
      Self::Event(event) => serde_json::json!(["EVENT", event.as_ref()]),
      Self::Req {
        subscription_id,
        filters,
      } => {
        let mut arr = vec![Value::String("REQ".into()), Value::String(subscription_id.clone())];
        arr.extend(filters.iter().map(Filter::as_value));
        Value::Array(arr)
      }
      Self::Close { subscription_id } => {
        serde_json::json!(["CLOSE", subscription_id])
      }
      Self::Auth(event) => serde_json::json!(["AUTH", event.as_ref()]),
    }
  }

  pub fn as_json(&self) -> String {
    self.as_value().to_string()
  }

  pub fn from_json(data: &str) -> Result<Self, Error> {
    let value: Value = serde_json::from_str(data)?;
    Self::from_value(&value)
  }

  pub fn from_value(value: &Value) -> Result<Self, Error> {
    let arr = value.as_array().ok_or(Error::UnknownFrame)?;
    let tag = arr.first().and_then(Value::as_str).ok_or(Error::UnknownFrame)?;

    match tag {
      "EVENT" if arr.len() == 2 => {
        let event: Event = serde_json::from_value(arr[1].clone())?;
        Ok(Self::event(event))
      }
      "REQ" if arr.len() >= 2 => {
        let subscription_id: String = serde_json::from_value(arr[1].clone())?;
        let mut filters = Vec::with_capacity(arr.len().saturating_sub(2));
        for f in &arr[2..] {
          filters.push(Filter::from_value(f)?);
        }
        Ok(Self::req(subscription_id, filters))
      }
      "CLOSE" if arr.len() == 2 => {
        let subscription_id: String = serde_json::from_value(arr[1].clone())?;
        Ok(Self::close(subscription_id))
      }
      "AUTH" if arr.len() == 2 => {
        let event: Event = serde_json::from_value(arr[1].clone())?;
        Ok(Self::auth(event))
      }
      _ => Err(Error::UnknownFrame),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn req_with_multiple_filters_round_trips() {
    let filters = vec![Filter::new().with_limit(1), Filter::new().with_limit(2)];
    let msg = ClientMessage::req("sub1", filters.clone());
    let json = msg.as_json();
    let back = ClientMessage::from_json(&json).unwrap();
    assert_eq!(back, msg);
  }

  #[test]
  fn req_without_filters_is_connect_only() {
    let msg = ClientMessage::req("sub1", vec![]);
    let back = ClientMessage::from_json(&msg.as_json()).unwrap();
    assert_eq!(back, msg);
  }

  #[test]
  fn close_round_trips() {
    let msg = ClientMessage::close("sub1");
    assert_eq!(msg.as_json(), r#"["CLOSE","sub1"]"#);
  }

  #[test]
  fn unknown_frame_does_not_panic() {
    let result = ClientMessage::from_json(r#"["BOGUS", 1, 2]"#);
    assert!(result.is_err());

    let result = ClientMessage::from_json("not json at all");
    assert!(result.is_err());
  }
}
