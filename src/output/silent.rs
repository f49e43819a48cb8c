use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until};
use tracing::debug;

use crate::audio::{pcm_from_bytes, AudioPlayback, Voice, VoiceId};
use crate::clock::Clock;
use crate::error::AudioError;
use crate::volume::{LevelMeter, LEVEL_WINDOW};

const BLOCK: Duration = Duration::from_millis(20);

type Tracks = Arc<Mutex<HashMap<String, Arc<Vec<f32>>>>>;
type Playing = Arc<Mutex<HashMap<VoiceId, JoinHandle<()>>>>;

/// Plays nothing, but keeps real time: a voice lasts as long as its mono
/// PCM would at `sample_rate` and reports the level it would have.
/// Voices run on the current tokio runtime.
pub struct SilentPlayback {
  clock: Arc<dyn Clock>,
  sample_rate: u32,
  tracks: Tracks,
  playing: Playing,
  gain: Arc<Mutex<f32>>,
}

impl SilentPlayback {
  pub fn new(clock: Arc<dyn Clock>, sample_rate: u32) -> Self {
    Self {
      clock,
      sample_rate: sample_rate.max(1),
      tracks: Arc::default(),
      playing: Arc::default(),
      gain: Arc::new(Mutex::new(1.0)),
    }
  }

  pub fn is_loaded(&self, name: &str) -> bool {
    lock(&self.tracks).contains_key(name)
  }

  pub fn playing(&self) -> usize {
    lock(&self.playing).len()
  }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|e| e.into_inner())
}

impl AudioPlayback for SilentPlayback {
  fn start_at(&self, track: &str, deadline_ms: i64) -> Result<Voice, AudioError> {
    let samples = lock(&self.tracks)
      .get(track)
      .cloned()
      .ok_or_else(|| AudioError::NotLoaded(track.to_string()))?;

    let id = VoiceId::next();
    let (level_tx, level) = watch::channel(0.0f32);
    let (finished_tx, finished) = oneshot::channel();
    let block_len = (self.sample_rate as usize * BLOCK.as_millis() as usize / 1_000).max(1);
    let start = self.clock.instant_at(deadline_ms);
    let gain = self.gain.clone();
    let playing = self.playing.clone();

    // hold the map lock so the task cannot deregister before it is registered
    let mut map = lock(&self.playing);
    let task = tokio::spawn(async move {
      sleep_until(start).await;
      let mut meter = LevelMeter::new(LEVEL_WINDOW);
      for block in samples.chunks(block_len) {
        let g = *lock(&gain);
        let scaled: Vec<f32> = block.iter().map(|s| s * g).collect();
        meter.add_samples(&scaled);
        level_tx.send_replace(meter.level());
        sleep(BLOCK).await;
      }
      level_tx.send_replace(0.0);
      lock(&playing).remove(&id);
      let _ = finished_tx.send(());
    });
    map.insert(id, task);
    debug!(%id, track, deadline_ms, "silent voice armed");
    Ok(Voice { id, level, finished })
  }

  fn stop(&self, id: VoiceId) {
    if let Some(task) = lock(&self.playing).remove(&id) {
      task.abort();
    }
  }

  fn preload(&self, name: &str, bytes: &[u8]) -> Result<(), AudioError> {
    let samples = pcm_from_bytes(bytes);
    lock(&self.tracks).insert(name.to_string(), Arc::new(samples));
    Ok(())
  }

  fn unload(&self, name: &str) {
    lock(&self.tracks).remove(name);
  }

  fn set_volume(&self, level: f32) {
    *lock(&self.gain) = level.clamp(0.0, 1.0);
  }
}

impl Drop for SilentPlayback {
  fn drop(&mut self) {
    for (_, task) in lock(&self.playing).drain() {
      task.abort();
    }
  }
}
