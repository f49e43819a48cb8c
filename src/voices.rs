use std::collections::BTreeMap;
use std::sync::Arc;

use crate::audio::{AudioPlayback, VoiceId};

/// Voices started by one scheduler and not yet released.
#[derive(Debug, Default)]
pub struct ActiveVoices {
  voices: BTreeMap<VoiceId, String>,
}

impl ActiveVoices {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, id: VoiceId, track: &str) {
    self.voices.insert(id, track.to_string());
  }

  /// Forgets a voice that ended on its own.
  pub fn remove(&mut self, id: VoiceId) -> bool {
    self.voices.remove(&id).is_some()
  }

  pub fn len(&self) -> usize {
    self.voices.len()
  }

  pub fn is_empty(&self) -> bool {
    self.voices.is_empty()
  }

  /// Stops every voice through `audio`. Returns how many were stopped.
  pub fn stop_all(&mut self, audio: &Arc<dyn AudioPlayback>) -> usize {
    let voices = std::mem::take(&mut self.voices);
    for (id, track) in &voices {
      tracing::debug!(%id, track, "stopping voice");
      audio.stop(*id);
    }
    voices.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::audio::Voice;
  use crate::error::AudioError;
  use std::sync::Mutex;

  #[derive(Default)]
  struct StopLog(Mutex<Vec<VoiceId>>);

  impl AudioPlayback for StopLog {
    fn start_at(&self, track: &str, _deadline_ms: i64) -> Result<Voice, AudioError> {
      Err(AudioError::NotLoaded(track.to_string()))
    }
    fn stop(&self, id: VoiceId) {
      self.0.lock().unwrap().push(id);
    }
    fn preload(&self, _name: &str, _bytes: &[u8]) -> Result<(), AudioError> {
      Ok(())
    }
    fn unload(&self, _name: &str) {}
    fn set_volume(&self, _level: f32) {}
  }

  #[test]
  fn stop_all_releases_everything() {
    let log = Arc::new(StopLog::default());
    let audio: Arc<dyn AudioPlayback> = log.clone();
    let mut voices = ActiveVoices::new();
    voices.add(VoiceId(1), "clap");
    voices.add(VoiceId(2), "tada");
    assert!(voices.remove(VoiceId(1)));
    assert!(!voices.remove(VoiceId(1)));
    assert_eq!(voices.stop_all(&audio), 1);
    assert!(voices.is_empty());
    assert_eq!(*log.0.lock().unwrap(), vec![VoiceId(2)]);
  }
}
