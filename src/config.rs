use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Sampling and playback policy. Every field has a default, so a TOML file
/// only needs the values it overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Known minimum one-way network delay, subtracted from both legs.
  pub one_way_floor_ms: i64,
  pub initial_rounds: u32,
  pub samples_per_round: u32,
  pub sample_interval_ms: u64,
  pub round_interval_ms: u64,
  pub extra_rounds: u32,
  pub excellent_below_ms: i64,
  pub good_below_ms: i64,
  /// Samples that must fall below a threshold before the run may finalize.
  pub required_count: usize,
  pub settle_delay_ms: u64,
  /// Feedback tick period while counting down or playing.
  pub frame_interval_ms: u64,
  /// Give up on a single probe after this long. Unset means wait forever.
  pub probe_timeout_ms: Option<u64>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      one_way_floor_ms: 0,
      initial_rounds: 8,
      samples_per_round: 5,
      sample_interval_ms: 100,
      round_interval_ms: 3_000,
      extra_rounds: 6,
      excellent_below_ms: 25,
      good_below_ms: 50,
      required_count: 3,
      settle_delay_ms: 2_000,
      frame_interval_ms: 16,
      probe_timeout_ms: None,
    }
  }
}

impl SyncConfig {
  pub fn from_toml_str(s: &str) -> Result<Self> {
    Ok(toml::from_str(s)?)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let text = std::fs::read_to_string(path)?;
    Self::from_toml_str(&text)
  }

  pub fn with_one_way_floor(mut self, ms: i64) -> Self {
    self.one_way_floor_ms = ms;
    self
  }

  pub fn sample_interval(&self) -> Duration {
    Duration::from_millis(self.sample_interval_ms)
  }

  pub fn round_interval(&self) -> Duration {
    Duration::from_millis(self.round_interval_ms)
  }

  pub fn settle_delay(&self) -> Duration {
    Duration::from_millis(self.settle_delay_ms)
  }

  pub fn frame_interval(&self) -> Duration {
    // interval() panics on a zero period
    Duration::from_millis(self.frame_interval_ms.max(1))
  }

  pub fn probe_timeout(&self) -> Option<Duration> {
    self.probe_timeout_ms.map(Duration::from_millis)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_policy_constants() {
    let c = SyncConfig::default();
    assert_eq!(c.initial_rounds, 8);
    assert_eq!(c.samples_per_round, 5);
    assert_eq!(c.sample_interval(), Duration::from_millis(100));
    assert_eq!(c.round_interval(), Duration::from_secs(3));
    assert_eq!(c.extra_rounds, 6);
    assert_eq!(c.excellent_below_ms, 25);
    assert_eq!(c.good_below_ms, 50);
    assert_eq!(c.settle_delay(), Duration::from_secs(2));
    assert_eq!(c.probe_timeout(), None);
  }

  #[test]
  fn partial_toml_overrides() {
    let c = SyncConfig::from_toml_str(
      "one_way_floor_ms = 20\nextra_rounds = 2\nprobe_timeout_ms = 1500\n",
    )
    .unwrap();
    assert_eq!(c.one_way_floor_ms, 20);
    assert_eq!(c.extra_rounds, 2);
    assert_eq!(c.probe_timeout(), Some(Duration::from_millis(1500)));
    assert_eq!(c.initial_rounds, 8);
  }

  #[test]
  fn rejects_wrong_types() {
    assert!(SyncConfig::from_toml_str("initial_rounds = \"many\"").is_err());
  }
}
