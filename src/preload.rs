use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::audio::AudioPlayback;

#[derive(Debug, Default)]
struct Liveness {
  superseded: bool,
  committed: bool,
}

struct Selection {
  name: String,
  live: Arc<Mutex<Liveness>>,
  task: JoinHandle<()>,
}

/// Preloads the selected track in the background. Selecting another track
/// supersedes the previous load: a load that finishes late is unloaded
/// instead of being published, unless the current selection has the same
/// name and so owns that buffer.
pub struct TrackLoader {
  audio: Arc<dyn AudioPlayback>,
  current: Option<Selection>,
  selected: Arc<Mutex<Option<String>>>,
  loaded: watch::Sender<Option<String>>,
}

impl TrackLoader {
  pub fn new(audio: Arc<dyn AudioPlayback>) -> Self {
    let (loaded, _) = watch::channel(None);
    Self { audio, current: None, selected: Arc::default(), loaded }
  }

  /// Name of the loaded track, `None` while loading or after a release.
  pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
    self.loaded.subscribe()
  }

  pub fn loaded(&self) -> Option<String> {
    self.loaded.borrow().clone()
  }

  pub fn select(&mut self, name: &str, bytes: Vec<u8>) {
    self.release();
    *lock(&self.selected) = Some(name.to_string());
    let live = Arc::new(Mutex::new(Liveness::default()));
    let task = tokio::spawn(preload(
      self.audio.clone(),
      name.to_string(),
      bytes,
      live.clone(),
      self.selected.clone(),
      self.loaded.clone(),
    ));
    self.current = Some(Selection { name: name.to_string(), live, task });
  }

  /// Drops the current selection. A committed track is unloaded now; one
  /// still loading unloads itself when it finishes.
  pub fn release(&mut self) {
    let Some(sel) = self.current.take() else {
      return;
    };
    let committed = {
      let mut live = lock(&sel.live);
      live.superseded = true;
      live.committed
    };
    *lock(&self.selected) = None;
    if committed {
      self.loaded.send_replace(None);
      self.audio.unload(&sel.name);
    }
    debug!(track = %sel.name, committed, "track selection released");
    // the task stays detached so a late decode can clean up after itself
    drop(sel.task);
  }
}

impl Drop for TrackLoader {
  fn drop(&mut self) {
    self.release();
  }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|e| e.into_inner())
}

async fn preload(
  audio: Arc<dyn AudioPlayback>,
  name: String,
  bytes: Vec<u8>,
  live: Arc<Mutex<Liveness>>,
  selected: Arc<Mutex<Option<String>>>,
  loaded: watch::Sender<Option<String>>,
) {
  let result = {
    let audio = audio.clone();
    let name = name.clone();
    tokio::task::spawn_blocking(move || audio.preload(&name, &bytes)).await
  };
  let mut live = lock(&live);
  match result {
    Ok(Ok(())) if live.superseded => {
      // buffers are keyed by name: a reselection of the same track owns it now
      if lock(&selected).as_deref() == Some(name.as_str()) {
        debug!(track = %name, "superseded preload left in place for reselection");
      } else {
        debug!(track = %name, "preload finished after being superseded");
        audio.unload(&name);
      }
    }
    Ok(Ok(())) => {
      live.committed = true;
      loaded.send_replace(Some(name));
    }
    Ok(Err(e)) => warn!(track = %name, "preload failed: {e}"),
    Err(e) => warn!(track = %name, "preload task failed: {e}"),
  }
}
