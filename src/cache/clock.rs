//! Time source abstraction for staleness checks.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Millisecond-resolution time source.
///
/// The offline store reads the clock for every staleness comparison and
/// entry write, so tests can substitute a controlled clock.
pub trait Clock: Send + Sync + 'static {
  /// Current time as epoch milliseconds.
  fn now_millis(&self) -> i64;
}

/// Wall-clock time for production use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_millis(&self) -> i64 {
    Utc::now().timestamp_millis()
  }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
  millis: AtomicI64,
}

impl ManualClock {
  pub fn new(millis: i64) -> Self {
    Self {
      millis: AtomicI64::new(millis),
    }
  }

  pub fn set_millis(&self, millis: i64) {
    self.millis.store(millis, Ordering::SeqCst);
  }

  pub fn advance(&self, duration: std::time::Duration) {
    self
      .millis
      .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_millis(&self) -> i64 {
    self.millis.load(Ordering::SeqCst)
  }
}
