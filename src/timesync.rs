// Round-trip samples and skew estimation from the best of them.

/// Number of samples averaged into the final skew.
pub const BEST_OF: usize = 3;

/// One probe exchange with the time authority.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
  pub client_send_ms: i64,
  pub server_ms: i64,
  /// Round-trip overhead beyond the configured one-way floor. Lower is better.
  pub combined_offset: i64,
  /// Authority clock minus local clock, in ms.
  pub clock_skew: f64,
}

impl Sample {
  // t1 = client send, s1 = server processing, t2 = client receive
  pub fn from_exchange(t1: i64, s1: i64, t2: i64, one_way_floor_ms: i64) -> Self {
    let offset1 = s1 - t1 - one_way_floor_ms;
    let offset2 = t2 - s1 - one_way_floor_ms;
    Self {
      client_send_ms: t1,
      server_ms: s1,
      combined_offset: offset1 + offset2,
      clock_skew: (offset1 - offset2) as f64 / 2.0,
    }
  }
}

/// Samples of one estimation run, in measurement order.
#[derive(Debug, Default, Clone)]
pub struct SampleSet {
  samples: Vec<Sample>,
}

impl SampleSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, sample: Sample) {
    self.samples.push(sample);
  }

  pub fn len(&self) -> usize {
    self.samples.len()
  }

  pub fn is_empty(&self) -> bool {
    self.samples.is_empty()
  }

  pub fn as_slice(&self) -> &[Sample] {
    &self.samples
  }

  pub fn clear(&mut self) {
    self.samples.clear();
  }

  pub fn is_acceptable(&self, max_offset_ms: i64, required_count: usize) -> bool {
    is_acceptable(&self.samples, max_offset_ms, required_count)
  }

  pub fn estimate_skew(&self) -> i64 {
    estimate_skew(&self.samples)
  }
}

/// True iff at least `required_count` samples have a combined offset strictly
/// below `max_offset_ms`.
pub fn is_acceptable(samples: &[Sample], max_offset_ms: i64, required_count: usize) -> bool {
  samples
    .iter()
    .filter(|s| s.combined_offset < max_offset_ms)
    .count()
    >= required_count
}

/// Rounded mean skew of the `BEST_OF` samples with the lowest combined
/// offset. Falls back to 0 with fewer samples than that.
pub fn estimate_skew(samples: &[Sample]) -> i64 {
  if samples.len() < BEST_OF {
    return 0;
  }
  let mut best: Vec<&Sample> = samples.iter().collect();
  // stable: ties keep measurement order
  best.sort_by_key(|s| s.combined_offset);
  let sum: f64 = best.iter().take(BEST_OF).map(|s| s.clock_skew).sum();
  // halves round towards +inf, so -2.5 becomes -2
  (sum / BEST_OF as f64 + 0.5).floor() as i64
}
