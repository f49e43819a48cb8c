use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::slot::ResultSlot;
use crate::timesync::{Sample, SampleSet};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorState {
  Idle,
  Sampling,
  Finalized,
}

#[derive(Debug, Default)]
struct RunSamples {
  set: SampleSet,
  closed: bool,
}

/// Probes the time authority in rounds until the samples are good enough,
/// then fixes the clock skew estimate for the rest of the session.
pub struct SyncController {
  config: SyncConfig,
  transport: Arc<dyn Transport>,
  clock: Arc<dyn Clock>,
  samples: Mutex<RunSamples>,
  skew: ResultSlot<i64>,
  state: watch::Sender<EstimatorState>,
  cancel: watch::Sender<bool>,
}

impl SyncController {
  pub fn new(
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let (state, _) = watch::channel(EstimatorState::Idle);
    let (cancel, _) = watch::channel(false);
    Self {
      config,
      transport,
      clock,
      samples: Mutex::new(RunSamples::default()),
      skew: ResultSlot::new(),
      state,
      cancel,
    }
  }

  pub fn config(&self) -> &SyncConfig {
    &self.config
  }

  pub fn state(&self) -> EstimatorState {
    *self.state.borrow()
  }

  pub fn subscribe_state(&self) -> watch::Receiver<EstimatorState> {
    self.state.subscribe()
  }

  /// Samples collected so far in the current run. Zero once finalized.
  pub fn sample_count(&self) -> usize {
    self.lock_samples().set.len()
  }

  pub fn skew(&self) -> Option<i64> {
    self.skew.get()
  }

  /// Waits for the finalized skew: authority clock minus local clock, in ms.
  pub async fn resolved_skew(&self) -> i64 {
    self.skew.wait().await
  }

  /// Runs the sampling phases until finalization or cancellation. Only the
  /// first call samples; later calls return immediately.
  pub async fn run(&self) {
    let started = self.state.send_if_modified(|s| {
      if *s != EstimatorState::Idle {
        return false;
      }
      *s = EstimatorState::Sampling;
      true
    });
    if !started {
      return;
    }
    info!("clock sampling started");

    tokio::select! {
      res = self.sample_phases() => {
        if let Err(e) = res {
          warn!("clock sampling stopped early: {e}");
        }
      }
      _ = cancelled(self.cancel.subscribe()) => {
        debug!("clock sampling cancelled");
      }
    }
    self.finalize();
  }

  /// Stops probing and finalizes with whatever samples exist. Idempotent.
  pub fn cancel(&self) {
    let first = self.cancel.send_if_modified(|c| !std::mem::replace(c, true));
    if first {
      info!("clock sampling cancel requested");
    }
    self.finalize();
  }

  /// Fixes the skew from the best samples collected so far and discards the
  /// sample set. Calls after the first have no effect.
  pub fn finalize(&self) {
    let (skew, count) = {
      let mut run = self.lock_samples();
      if run.closed {
        return;
      }
      run.closed = true;
      let count = run.set.len();
      let skew = run.set.estimate_skew();
      run.set.clear();
      (skew, count)
    };
    if count < crate::timesync::BEST_OF {
      warn!(samples = count, "too few samples, assuming zero clock skew");
    }
    self.skew.resolve(skew);
    self.state.send_replace(EstimatorState::Finalized);
    info!(skew_ms = skew, samples = count, "clock skew resolved");
  }

  /// Takes one probe and appends it to the run. `None` when the probe timed
  /// out or the run was already finalized.
  pub async fn collect_sample(&self) -> Result<Option<Sample>> {
    let Some(sample) = self.probe().await? else {
      return Ok(None);
    };
    let mut run = self.lock_samples();
    if run.closed {
      return Ok(None);
    }
    run.set.push(sample);
    debug!(
      combined_offset_ms = sample.combined_offset,
      clock_skew_ms = sample.clock_skew,
      n = run.set.len(),
      "sample"
    );
    Ok(Some(sample))
  }

  /// At least `required_count` samples below `max_offset_ms`.
  pub fn is_acceptable(&self, max_offset_ms: i64) -> bool {
    self
      .lock_samples()
      .set
      .is_acceptable(max_offset_ms, self.config.required_count)
  }

  async fn sample_phases(&self) -> Result<()> {
    let c = &self.config;

    // Warm-up: absorbs connection setup latency and is never evaluated.
    if let Some(warmup) = self.probe().await? {
      debug!(combined_offset_ms = warmup.combined_offset, "discarded warm-up sample");
    }

    if self.sample_rounds(c.initial_rounds, c.excellent_below_ms).await? {
      return Ok(());
    }
    if self.is_acceptable(c.good_below_ms) {
      debug!("initial rounds meet the good threshold");
      return Ok(());
    }
    if self.sample_rounds(c.extra_rounds, c.good_below_ms).await? {
      return Ok(());
    }
    warn!("no acceptable samples after extra rounds, using best effort");
    Ok(())
  }

  /// Returns true as soon as the sample set meets `threshold_ms`.
  async fn sample_rounds(&self, rounds: u32, threshold_ms: i64) -> Result<bool> {
    let per_round = self.config.samples_per_round;
    for round in 0..rounds {
      for i in 0..per_round {
        self.collect_sample().await?;
        if self.is_acceptable(threshold_ms) {
          debug!(round, threshold_ms, "samples acceptable");
          return Ok(true);
        }
        if i + 1 < per_round {
          sleep(self.config.sample_interval()).await;
        }
      }
      if round + 1 < rounds {
        sleep(self.config.round_interval()).await;
      }
    }
    Ok(false)
  }

  async fn probe(&self) -> Result<Option<Sample>> {
    let t1 = self.clock.now_ms();
    let reply = self.transport.send_probe(t1);
    let s1 = match self.config.probe_timeout() {
      Some(limit) => match tokio::time::timeout(limit, reply).await {
        Ok(s1) => s1?,
        Err(_) => {
          warn!(t1_ms = t1, "probe timed out");
          return Ok(None);
        }
      },
      None => reply.await?,
    };
    let t2 = self.clock.now_ms();
    Ok(Some(Sample::from_exchange(t1, s1, t2, self.config.one_way_floor_ms)))
  }

  fn lock_samples(&self) -> MutexGuard<'_, RunSamples> {
    self.samples.lock().unwrap_or_else(|e| e.into_inner())
  }
}

async fn cancelled(mut rx: watch::Receiver<bool>) {
  while !*rx.borrow_and_update() {
    if rx.changed().await.is_err() {
      std::future::pending::<()>().await;
    }
  }
}
