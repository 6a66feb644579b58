use std::time::Duration;

use rand_core::{OsRng, RngCore};

use crate::config::RetryPolicy;

/// Delays between attempts: doubling (by default) from `initial_ms` up to
/// `max_ms`, each with up to its own length again of random jitter.
pub struct Backoff {
  policy:  RetryPolicy,
  attempt: u32,
  current: f64,
}

impl Backoff {
  pub fn new(policy: &RetryPolicy) -> Self {
    Self { policy: policy.clone(), attempt: 1, current: policy.initial_ms as f64 }
  }

  /// Attempts made so far.
  pub fn attempt(&self) -> u32 { self.attempt }

  /// The wait before the next attempt, or `None` once attempts are used up.
  pub fn next_delay(&mut self) -> Option<Duration> {
    if self.attempt >= self.policy.max_attempts {
      return None;
    }
    self.attempt += 1;

    let base = self.current.min(self.policy.max_ms as f64).max(0.0) as u64;
    let jitter = OsRng.next_u64() % (base + 1);
    self.current = (self.current * self.policy.factor).min(self.policy.max_ms as f64);
    Some(Duration::from_millis(base + jitter))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn grows_caps_and_stops() {
    let policy = RetryPolicy { initial_ms: 100, factor: 2.0, max_ms: 300, max_attempts: 5 };
    let mut backoff = Backoff::new(&policy);

    let bases = [100, 200, 300, 300];
    for base in bases {
      let delay = backoff.next_delay().unwrap().as_millis() as u64;
      assert!((base..=2 * base).contains(&delay), "{delay} not in {base}..={}", 2 * base);
    }
    assert_eq!(backoff.attempt(), 5);
    assert!(backoff.next_delay().is_none());
  }

  #[test]
  fn single_attempt_never_retries() {
    let policy = RetryPolicy { max_attempts: 1, ..RetryPolicy::default() };
    assert!(Backoff::new(&policy).next_delay().is_none());
  }
}
