use std::collections::VecDeque;

/// Samples the level is averaged over, as read by a 2048-point analyser.
pub const LEVEL_WINDOW: usize = 1_024;

/// Mean absolute amplitude of the most recently played samples. Feeds a
/// voice's level signal.
#[derive(Debug)]
pub struct LevelMeter {
  window: usize,
  recent: VecDeque<f32>,
  sum_abs: f64,
}

impl LevelMeter {
  pub fn new(window: usize) -> Self {
    let window = window.max(1);
    Self { window, recent: VecDeque::with_capacity(window), sum_abs: 0.0 }
  }

  pub fn add_samples(&mut self, data: &[f32]) {
    // only the tail can survive
    let tail = &data[data.len().saturating_sub(self.window)..];
    for &v in tail {
      if self.recent.len() == self.window {
        if let Some(old) = self.recent.pop_front() {
          self.sum_abs -= old as f64;
        }
      }
      let a = v.abs();
      self.recent.push_back(a);
      self.sum_abs += a as f64;
    }
  }

  /// Mean |sample| over the window, 0.0..=1.0.
  pub fn level(&self) -> f32 {
    if self.recent.is_empty() {
      return 0.0;
    }
    (self.sum_abs.max(0.0) / self.recent.len() as f64).clamp(0.0, 1.0) as f32
  }

  pub fn reset(&mut self) {
    self.recent.clear();
    self.sum_abs = 0.0;
  }
}

// exponential ramps cannot reach zero
const MIN_GAIN: f32 = 1e-4;

/// Per-frame output gain that moves exponentially towards its target.
#[derive(Debug, Clone, Copy)]
pub struct GainRamp {
  current: f32,
  target: f32,
  factor: f32,
  remaining: u32,
}

impl GainRamp {
  pub fn new(level: f32) -> Self {
    let level = level.max(MIN_GAIN);
    Self { current: level, target: level, factor: 1.0, remaining: 0 }
  }

  /// Reaches `level` after `frames` calls to `next_gain`.
  pub fn ramp_to(&mut self, level: f32, frames: u32) {
    self.target = level.max(MIN_GAIN);
    if frames == 0 {
      self.current = self.target;
      self.remaining = 0;
      return;
    }
    self.factor = (self.target / self.current).powf(1.0 / frames as f32);
    self.remaining = frames;
  }

  pub fn next_gain(&mut self) -> f32 {
    if self.remaining > 0 {
      self.remaining -= 1;
      self.current = if self.remaining == 0 {
        self.target
      } else {
        self.current * self.factor
      };
    }
    self.current
  }

  pub fn current(&self) -> f32 {
    self.current
  }
}
