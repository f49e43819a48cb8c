// Audio playback collaborator. The scheduler only needs to start a preloaded
// track at a local deadline, observe its level, and stop it.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{oneshot, watch};

use crate::error::AudioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

impl VoiceId {
  pub fn next() -> Self {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    VoiceId(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

impl std::fmt::Display for VoiceId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "voice#{}", self.0)
  }
}

/// A started playback.
#[derive(Debug)]
pub struct Voice {
  pub id: VoiceId,
  /// Live amplitude, 0.0..=1.0, updated while the voice plays.
  pub level: watch::Receiver<f32>,
  /// Completes when the track has played to its end. Dropped without a
  /// value when the voice is stopped early.
  pub finished: oneshot::Receiver<()>,
}

pub trait AudioPlayback: Send + Sync {
  /// Starts `track` so that its first frame sounds at `deadline_ms` local
  /// time, or immediately if that moment has passed.
  fn start_at(&self, track: &str, deadline_ms: i64) -> Result<Voice, AudioError>;

  /// Stops and releases a voice. Unknown or finished voices are ignored.
  fn stop(&self, id: VoiceId);

  /// Decodes and keeps `bytes` under `name`. May block.
  fn preload(&self, name: &str, bytes: &[u8]) -> Result<(), AudioError>;

  fn unload(&self, name: &str);

  /// Ramps the output gain to `level`.
  fn set_volume(&self, level: f32);
}

/// Interprets raw bytes as interleaved little-endian f32 PCM. A trailing
/// partial sample is ignored.
pub fn pcm_from_bytes(bytes: &[u8]) -> Vec<f32> {
  let whole = bytes.len() / 4 * 4;
  match bytemuck::try_cast_slice::<u8, f32>(&bytes[..whole]) {
    Ok(samples) if cfg!(target_endian = "little") => samples.to_vec(),
    // unaligned input or big-endian host
    _ => bytes[..whole]
      .chunks_exact(4)
      .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
      .collect(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn voice_ids_are_unique() {
    let a = VoiceId::next();
    let b = VoiceId::next();
    assert_ne!(a, b);
  }

  #[test]
  fn pcm_ignores_partial_tail() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0.5f32.to_le_bytes());
    bytes.extend_from_slice(&(-1.0f32).to_le_bytes());
    bytes.push(0xff);
    assert_eq!(pcm_from_bytes(&bytes), vec![0.5, -1.0]);
  }
}
