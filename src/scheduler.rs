use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::audio::{AudioPlayback, Voice};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::session::SyncSession;
use crate::voices::ActiveVoices;

/// What the UI should show right now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Feedback {
  Idle,
  /// Whole seconds until the deadline, floored.
  Countdown { seconds: i64 },
  /// Live level of the playing voice, 0.0..=1.0.
  Playing { level: f32 },
}

/// Local time at which a start scheduled for server time `target_ms` must
/// fire, given the authority's lead `skew_ms`.
pub fn playback_deadline(target_ms: i64, skew_ms: i64) -> i64 {
  target_ms - skew_ms
}

/// Fires a preloaded track at a skew-corrected deadline and drives per-frame
/// feedback until it ends.
pub struct PlaybackScheduler {
  audio: Arc<dyn AudioPlayback>,
  clock: Arc<dyn Clock>,
  frame_interval: Duration,
  settle_delay: Duration,
  voices: Mutex<ActiveVoices>,
  feedback: watch::Sender<Feedback>,
  armed: watch::Sender<Option<i64>>,
  cycles: AtomicU64,
}

impl PlaybackScheduler {
  pub fn new(audio: Arc<dyn AudioPlayback>, clock: Arc<dyn Clock>, config: &SyncConfig) -> Self {
    let (feedback, _) = watch::channel(Feedback::Idle);
    let (armed, _) = watch::channel(None);
    Self {
      audio,
      clock,
      frame_interval: config.frame_interval(),
      settle_delay: config.settle_delay(),
      voices: Mutex::new(ActiveVoices::new()),
      feedback,
      armed,
      cycles: AtomicU64::new(0),
    }
  }

  pub fn feedback(&self) -> watch::Receiver<Feedback> {
    self.feedback.subscribe()
  }

  /// Deadline of the pending or playing start, if any.
  pub fn armed_deadline(&self) -> Option<i64> {
    *self.armed.borrow()
  }

  pub fn subscribe_armed(&self) -> watch::Receiver<Option<i64>> {
    self.armed.subscribe()
  }

  pub fn active_voices(&self) -> usize {
    self.lock_voices().len()
  }

  /// Playback cycles that ran to completion and settled.
  pub fn completed_cycles(&self) -> u64 {
    self.cycles.load(Ordering::Relaxed)
  }

  /// Plays `track` every time the session is scheduled, forever. Returns
  /// only when an audio start fails; the schedule is rearmed first so a
  /// stale deadline is never replayed.
  pub async fn run(&self, session: &SyncSession, track: &str) -> Result<()> {
    loop {
      let skew_ms = session.resolved_skew().await;
      let target_ms = session.scheduled_time().await;
      if let Err(e) = self.play_at(track, target_ms, skew_ms).await {
        session.request_reschedule();
        return Err(e);
      }
      sleep(self.settle_delay).await;
      session.request_reschedule();
      let n = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
      info!(cycles = n, "ready for next schedule");
    }
  }

  /// Spawns `run` and returns a handle that tears everything down.
  pub fn spawn(self: &Arc<Self>, session: Arc<SyncSession>, track: String) -> PlaybackTask {
    let scheduler = self.clone();
    let handle = tokio::spawn(async move { scheduler.run(&session, &track).await });
    PlaybackTask { handle: Some(handle), scheduler: self.clone() }
  }

  /// One cycle: count down to the deadline, start the voice, follow its
  /// level until it ends. Dropping the future stops everything it started.
  pub async fn play_at(&self, track: &str, target_ms: i64, skew_ms: i64) -> Result<()> {
    let deadline = playback_deadline(target_ms, skew_ms);
    // one voice per run: release whatever is still sounding
    self.release_voices();
    let _cycle = CycleGuard { scheduler: self };
    self.armed.send_replace(Some(deadline));
    info!(track, target_ms, skew_ms, deadline_ms = deadline, "playback armed");

    let mut frames = interval(self.frame_interval);
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let fire = sleep_until(self.clock.instant_at(deadline));
    tokio::pin!(fire);
    loop {
      tokio::select! {
        biased;
        _ = &mut fire => break,
        _ = frames.tick() => {
          let remaining = deadline - self.clock.now_ms();
          self.feedback.send_replace(Feedback::Countdown { seconds: remaining.div_euclid(1_000) });
        }
      }
    }

    let Voice { id, mut level, mut finished } = match self.audio.start_at(track, deadline) {
      Ok(voice) => voice,
      Err(e) => {
        warn!(track, "audio start failed: {e}");
        return Err(e.into());
      }
    };
    self.lock_voices().add(id, track);
    info!(%id, late_ms = self.clock.now_ms() - deadline, "playback started");
    self.feedback.send_replace(Feedback::Playing { level: *level.borrow_and_update() });

    loop {
      tokio::select! {
        biased;
        ended = &mut finished => {
          if ended.is_err() {
            debug!(%id, "voice released before its end");
          }
          break;
        }
        _ = frames.tick() => {
          self.feedback.send_replace(Feedback::Playing { level: *level.borrow_and_update() });
        }
      }
    }
    self.lock_voices().remove(id);
    info!(%id, "playback finished");
    Ok(())
  }

  /// Stops every voice and clears the armed deadline and feedback.
  pub fn shutdown(&self) {
    self.release_voices();
    self.armed.send_replace(None);
    self.feedback.send_replace(Feedback::Idle);
  }

  fn release_voices(&self) {
    let stopped = self.lock_voices().stop_all(&self.audio);
    if stopped > 0 {
      debug!(stopped, "released active voices");
    }
  }

  fn lock_voices(&self) -> MutexGuard<'_, ActiveVoices> {
    self.voices.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Resets scheduler state on every exit from a cycle, including drop.
struct CycleGuard<'a> {
  scheduler: &'a PlaybackScheduler,
}

impl Drop for CycleGuard<'_> {
  fn drop(&mut self) {
    self.scheduler.shutdown();
  }
}

/// A spawned scheduler loop. Dropping it cancels the loop and releases audio.
pub struct PlaybackTask {
  handle: Option<JoinHandle<Result<()>>>,
  scheduler: Arc<PlaybackScheduler>,
}

impl PlaybackTask {
  pub fn is_finished(&self) -> bool {
    self.handle.as_ref().map_or(true, JoinHandle::is_finished)
  }

  /// Waits for the loop to end on its own, i.e. for an audio start failure.
  pub async fn join(mut self) -> Result<()> {
    let Some(handle) = self.handle.take() else {
      return Ok(());
    };
    handle.await?
  }

  /// Cancels the loop and waits until nothing it armed can fire.
  pub async fn cancel(mut self) {
    if let Some(handle) = self.handle.take() {
      handle.abort();
      let _ = handle.await;
    }
    self.scheduler.shutdown();
  }
}

impl Drop for PlaybackTask {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      handle.abort();
      self.scheduler.shutdown();
    }
  }
}
