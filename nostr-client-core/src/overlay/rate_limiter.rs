//! Token bucket gating outbound RPC calls (§4.G step 3): continuous
//! refill, configurable capacity, default 30 requests/minute.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
  capacity: f64,
  refill_per_sec: f64,
  state: StdMutex<(f64, Instant)>,
}

impl RateLimiter {
  pub fn new(requests_per_minute: u32) -> Self {
    let capacity = requests_per_minute.max(1) as f64;
    Self {
      capacity,
      refill_per_sec: capacity / 60.0,
      state: StdMutex::new((capacity, Instant::now())),
    }
  }

  fn refill(&self) -> f64 {
    let mut state = self.state.lock().expect("rate limiter mutex poisoned");
    let elapsed = state.1.elapsed().as_secs_f64();
    state.0 = (state.0 + elapsed * self.refill_per_sec).min(self.capacity);
    state.1 = Instant::now();
    state.0
  }

  /// Waits until a token is available, then consumes it.
  pub async fn acquire(&self) {
    loop {
      let tokens = self.refill();
      if tokens >= 1.0 {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        state.0 -= 1.0;
        return;
      }
      let deficit = 1.0 - tokens;
      let wait = Duration::from_secs_f64((deficit / self.refill_per_sec).max(0.01));
      tokio::time::sleep(wait).await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[tokio::test]
  async fn acquires_immediately_while_tokens_remain() {
    let limiter = RateLimiter::new(60);
    for _ in 0..5 {
      tokio::time::timeout(Duration::from_millis(50), limiter.acquire())
        .await
        .expect("should not need to wait for refill");
    }
  }

  #[test]
  fn capacity_floors_at_one_for_tiny_configured_rates() {
    let limiter = RateLimiter::new(0);
    assert_eq!(limiter.capacity, 1.0);
  }
}
