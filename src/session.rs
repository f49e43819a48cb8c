use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::audio::AudioPlayback;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::slot::ResultSlot;
use crate::sync_controller::{EstimatorState, SyncController};
use crate::transport::{ServerEvent, Transport};

/// Long-lived coordinator for one client session. Owns the estimation run:
/// the skew, resolved once by the sync controller, and the scheduled start
/// time, which is rearmed after every playback cycle.
///
/// Methods that start sampling spawn onto the current tokio runtime.
pub struct SyncSession {
  controller: Arc<SyncController>,
  scheduled: ResultSlot<i64>,
  sampling: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
  pub fn new(
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      controller: Arc::new(SyncController::new(config, transport, clock)),
      scheduled: ResultSlot::new(),
      sampling: Mutex::new(None),
    }
  }

  pub fn controller(&self) -> &Arc<SyncController> {
    &self.controller
  }

  pub fn state(&self) -> EstimatorState {
    self.controller.state()
  }

  /// Rearms the scheduled-time slot and starts sampling if it never ran.
  pub fn start(&self) {
    self.request_reschedule();
  }

  fn ensure_sampling(&self) {
    let mut task = self.sampling.lock().unwrap_or_else(|e| e.into_inner());
    if task.is_none() {
      let controller = self.controller.clone();
      *task = Some(tokio::spawn(async move { controller.run().await }));
    }
  }

  /// Authority clock minus local clock in ms, once sampling has finalized.
  pub async fn resolved_skew(&self) -> i64 {
    self.ensure_sampling();
    self.controller.resolved_skew().await
  }

  /// Next server-issued start time. Waits for a schedule push if the slot is
  /// unresolved.
  pub async fn scheduled_time(&self) -> i64 {
    self.ensure_sampling();
    self.scheduled.wait().await
  }

  pub fn pending_schedule(&self) -> Option<i64> {
    self.scheduled.get()
  }

  /// Clears the scheduled time so the next push can fill it. The skew is
  /// kept, and sampling starts if it never ran.
  pub fn request_reschedule(&self) {
    if self.clear_scheduled_time() {
      debug!("scheduled time slot rearmed");
    }
    self.ensure_sampling();
  }

  /// Drops a pending scheduled time and nothing else. Returns false if the
  /// slot was already empty.
  pub fn clear_scheduled_time(&self) -> bool {
    self.scheduled.rearm()
  }

  /// Accepts a pushed start time. Ignored while a previous one is pending.
  pub fn on_schedule_push(&self, time_ms: i64) -> bool {
    let accepted = self.scheduled.resolve(time_ms);
    if accepted {
      info!(time_ms, "playback scheduled");
    } else {
      debug!(time_ms, "schedule push ignored, previous schedule pending");
    }
    accepted
  }

  pub fn handle_event(&self, event: ServerEvent, audio: &dyn AudioPlayback) {
    match event {
      ServerEvent::Schedule { time_ms } => {
        self.on_schedule_push(time_ms);
      }
      ServerEvent::Volume { level } => audio.set_volume(level.clamp(0.0, 1.0)),
    }
  }

  /// Stops sampling and finalizes with the samples so far. Idempotent.
  pub fn cancel(&self) {
    self.controller.cancel();
  }
}

impl Drop for SyncSession {
  fn drop(&mut self) {
    if let Some(task) = self.sampling.get_mut().ok().and_then(Option::take) {
      task.abort();
    }
  }
}
