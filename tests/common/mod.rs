#![allow(dead_code)]

use async_trait::async_trait;
use conductor::audio::{AudioPlayback, Voice, VoiceId};
use conductor::clock::{Clock, LocalClock};
use conductor::transport::Transport;
use conductor::{AudioError, Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Authority reached over a link with a fixed one-way delay, whose clock
/// runs `lead_ms` ahead of the local one.
pub struct FixedLink {
  clock: LocalClock,
  one_way: Duration,
  lead_ms: i64,
  probes: AtomicUsize,
  /// 1-based probe number from which every probe fails.
  pub fail_from: Option<usize>,
  /// Never answer.
  pub silent: bool,
}

impl FixedLink {
  pub fn new(clock: LocalClock, one_way_ms: u64, lead_ms: i64) -> Self {
    Self {
      clock,
      one_way: Duration::from_millis(one_way_ms),
      lead_ms,
      probes: AtomicUsize::new(0),
      fail_from: None,
      silent: false,
    }
  }

  pub fn probes(&self) -> usize {
    self.probes.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Transport for FixedLink {
  async fn send_probe(&self, _t1_ms: i64) -> Result<i64> {
    let n = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
    if self.fail_from.is_some_and(|from| n >= from) {
      return Err(Error::Transport("link down".into()));
    }
    if self.silent {
      std::future::pending::<()>().await;
    }
    sleep(self.one_way).await;
    let s1 = self.clock.now_ms() + self.lead_ms;
    sleep(self.one_way).await;
    Ok(s1)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Start {
  pub id: VoiceId,
  pub track: String,
  pub deadline_ms: i64,
  /// Local time at which the start was requested.
  pub at_ms: i64,
}

/// Audio backend that records what it was asked to do. Voices last `length`.
pub struct Recorder {
  clock: LocalClock,
  length: Duration,
  fail: bool,
  starts: Mutex<Vec<Start>>,
  stopped: Mutex<Vec<VoiceId>>,
  playing: Mutex<HashMap<VoiceId, JoinHandle<()>>>,
  volume: Mutex<Option<f32>>,
}

impl Recorder {
  pub fn new(clock: LocalClock, length: Duration) -> Self {
    Self {
      clock,
      length,
      fail: false,
      starts: Mutex::default(),
      stopped: Mutex::default(),
      playing: Mutex::default(),
      volume: Mutex::default(),
    }
  }

  pub fn failing(clock: LocalClock) -> Self {
    Self { fail: true, ..Self::new(clock, Duration::ZERO) }
  }

  pub fn starts(&self) -> Vec<Start> {
    self.starts.lock().unwrap().clone()
  }

  pub fn stopped(&self) -> Vec<VoiceId> {
    self.stopped.lock().unwrap().clone()
  }

  pub fn volume(&self) -> Option<f32> {
    *self.volume.lock().unwrap()
  }
}

impl AudioPlayback for Recorder {
  fn start_at(&self, track: &str, deadline_ms: i64) -> std::result::Result<Voice, AudioError> {
    if self.fail {
      return Err(AudioError::Backend("device lost".into()));
    }
    let id = VoiceId::next();
    self.starts.lock().unwrap().push(Start {
      id,
      track: track.to_string(),
      deadline_ms,
      at_ms: self.clock.now_ms(),
    });
    let (level_tx, level) = watch::channel(0.5f32);
    let (done_tx, finished) = oneshot::channel();
    let length = self.length;
    let task = tokio::spawn(async move {
      sleep(length).await;
      let _ = level_tx.send(0.0);
      let _ = done_tx.send(());
    });
    self.playing.lock().unwrap().insert(id, task);
    Ok(Voice { id, level, finished })
  }

  fn stop(&self, id: VoiceId) {
    self.stopped.lock().unwrap().push(id);
    if let Some(task) = self.playing.lock().unwrap().remove(&id) {
      task.abort();
    }
  }

  fn preload(&self, _name: &str, _bytes: &[u8]) -> std::result::Result<(), AudioError> {
    Ok(())
  }

  fn unload(&self, _name: &str) {}

  fn set_volume(&self, level: f32) {
    *self.volume.lock().unwrap() = Some(level);
  }
}
