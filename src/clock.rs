// Local wall clock in milliseconds, anchored to the tokio timer so that
// deadlines expressed in local milliseconds can be slept on directly.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

pub trait Clock: Send + Sync {
  /// Current local time, ms since UNIX epoch.
  fn now_ms(&self) -> i64;
  /// Timer instant at which `now_ms()` reaches `ms`. Past timestamps map to
  /// an instant that has already elapsed.
  fn instant_at(&self, ms: i64) -> Instant;
}

#[derive(Debug, Clone, Copy)]
pub struct LocalClock {
  anchor_ms: i64,
  anchor: Instant,
}

impl LocalClock {
  pub fn new() -> Self {
    Self::starting_at(system_now_ms())
  }

  /// A clock that reads `ms` right now. Useful when the tokio clock is
  /// paused in tests.
  pub fn starting_at(ms: i64) -> Self {
    Self { anchor_ms: ms, anchor: Instant::now() }
  }
}

impl Default for LocalClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for LocalClock {
  fn now_ms(&self) -> i64 {
    let elapsed = Instant::now().saturating_duration_since(self.anchor);
    self.anchor_ms + elapsed.as_millis() as i64
  }

  fn instant_at(&self, ms: i64) -> Instant {
    let ahead = ms.saturating_sub(self.anchor_ms).max(0) as u64;
    self.anchor + Duration::from_millis(ahead)
  }
}

pub fn system_now_ms() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_else(|_| Duration::from_millis(0))
    .as_millis() as i64
}
