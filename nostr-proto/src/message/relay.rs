use serde_json::Value;

use super::Error;
use crate::event::Event;

/// A relay→client frame: `["EVENT", sub_id, e]`, `["OK", event_id,
/// accepted, message]`, `["EOSE", sub_id]`, `["CLOSED", sub_id, message]`,
/// `["NOTICE", text]`, or `["AUTH", challenge]`.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
  Event {
    subscription_id: String,
    event: Box<Event>,
  },
  Ok {
    event_id: String,
    accepted: bool,
    message: String,
  },
  Eose {
    subscription_id: String,
  },
  Closed {
    subscription_id: String,
    message: String,
  },
  Notice {
    message: String,
  },
  Auth {
    challenge: String,
  },
}

impl RelayMessage {
  pub fn as_value(&self) -> Value {
    match self {
      Self::Event { subscription_id, event } => {
        serde_json::json!(["EVENT", subscription_id, event.as_ref()])
      }
      Self::Ok {
        event_id,
        accepted,
        message,
      } => serde_json::json!(["OK", event_id, accepted, message]),
      Self::Eose { subscription_id } => serde_json::json!(["EOSE", subscription_id]),
      Self::Closed {
        subscription_id,
        message,
      } => serde_json::json!(["CLOSED", subscription_id, message]),
      Self::Notice { message } => serde_json::json!(["NOTICE", message]),
      Self::Auth { challenge } => serde_json::json!(["AUTH", challenge]),
    }
  }

  pub fn as_json(&self) -> String {
    self.as_value().to_string()
  }

  pub fn from_json(data: &str) -> Result<Self, Error> {
    let value: Value = serde_json::from_str(data)?;
    Self::from_value(&value)
  }

  /// Decodes a frame, never panicking. Unknown/malformed frames are
  /// counted and dropped by callers (§4.A, §7 "Protocol" errors).
  pub fn from_value(value: &Value) -> Result<Self, Error> {
    let arr = value.as_array().ok_or(Error::UnknownFrame)?;
    let tag = arr.first().and_then(Value::as_str).ok_or(Error::UnknownFrame)?;

    match tag {
      "EVENT" if arr.len() == 3 => {
        let subscription_id: String = serde_json::from_value(arr[1].clone())?;
        let event: Event = serde_json::from_value(arr[2].clone())?;
        Ok(Self::Event {
          subscription_id,
          event: Box::new(event),
        })
      }
      "OK" if arr.len() == 4 => {
        let event_id: String = serde_json::from_value(arr[1].clone())?;
        let accepted: bool = serde_json::from_value(arr[2].clone())?;
        let message: String = serde_json::from_value(arr[3].clone())?;
        Ok(Self::Ok {
          event_id,
          accepted,
          message,
        })
      }
      "EOSE" if arr.len() == 2 => {
        let subscription_id: String = serde_json::from_value(arr[1].clone())?;
        Ok(Self::Eose { subscription_id })
      }
      "CLOSED" if arr.len() == 3 => {
        let subscription_id: String = serde_json::from_value(arr[1].clone())?;
        let message: String = serde_json::from_value(arr[2].clone())?;
        Ok(Self::Closed {
          subscription_id,
          message,
        })
      }
      "NOTICE" if arr.len() == 2 => {
        let message: String = serde_json::from_value(arr[1].clone())?;
        Ok(Self::Notice { message })
      }
      "AUTH" if arr.len() == 2 => {
        let challenge: String = serde_json::from_value(arr[1].clone())?;
        Ok(Self::Auth { challenge })
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
  fn eose_round_trips() {
    let msg = RelayMessage::Eose {
      subscription_id: "sub1".to_string(),
    };
    assert_eq!(msg.as_json(), r#"["EOSE","sub1"]"#);
    assert_eq!(RelayMessage::from_json(&msg.as_json()).unwrap(), msg);
  }

  #[test]
  fn ok_round_trips_with_rejection_message() {
    let msg = RelayMessage::Ok {
      event_id: "aa".to_string(),
      accepted: false,
      message: "duplicate".to_string(),
    };
    assert_eq!(RelayMessage::from_json(&msg.as_json()).unwrap(), msg);
  }

  #[test]
  fn unknown_and_malformed_frames_are_errors_not_panics() {
    assert!(RelayMessage::from_json(r#"["EOSE"]"#).is_err());
    assert!(RelayMessage::from_json(r#"{"not":"an array"}"#).is_err());
    assert!(RelayMessage::from_json("42").is_err());
    assert!(RelayMessage::from_json(r#"["PING"]"#).is_err());
  }

  #[test]
  fn notice_round_trips() {
    let msg = RelayMessage::Notice {
      message: "rate limited".to_string(),
    };
    assert_eq!(RelayMessage::from_json(&msg.as_json()).unwrap(), msg);
  }

  #[test]
  fn auth_challenge_round_trips() {
    let msg = RelayMessage::Auth {
      challenge: "chal123".to_string(),
    };
    assert_eq!(RelayMessage::from_json(&msg.as_json()).unwrap(), msg);
  }
}
