//! Health scoring (§4.E "Health model"): a relay's score in `[0,1]`
//! nudged by fixed impacts per event, clamped, with a delegate callback
//! fired whenever a relay crosses `min_health`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
  ConnectionFailure,
  Timeout,
  PublishFailure,
  EventRejected,
  ConnectionSuccess,
  PublishSuccess,
}

impl HealthEvent {
  pub fn impact(self) -> f64 {
    match self {
      Self::ConnectionFailure => -0.3,
      Self::Timeout => -0.2,
      Self::PublishFailure => -0.1,
      Self::EventRejected => -0.05,
      Self::ConnectionSuccess => 0.1,
      Self::PublishSuccess => 0.05,
    }
  }
}

pub fn apply(current: f64, event: HealthEvent) -> f64 {
  (current + event.impact()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn health_clamps_to_unit_interval() {
    assert_eq!(apply(0.0, HealthEvent::ConnectionFailure), 0.0);
    assert_eq!(apply(1.0, HealthEvent::ConnectionSuccess), 1.0);
  }

  #[test]
  fn impacts_match_spec_table() {
    assert_eq!(apply(0.5, HealthEvent::ConnectionFailure), 0.2);
    assert_eq!(apply(0.5, HealthEvent::Timeout), 0.3);
    assert_eq!(apply(0.5, HealthEvent::PublishFailure), 0.4);
    assert_eq!(apply(0.5, HealthEvent::EventRejected), 0.45);
    assert_eq!(apply(0.5, HealthEvent::ConnectionSuccess), 0.6);
    assert_eq!(apply(0.5, HealthEvent::PublishSuccess), 0.55);
  }
}
