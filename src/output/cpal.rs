use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info};

use crate::audio::{pcm_from_bytes, AudioPlayback, Voice, VoiceId};
use crate::clock::Clock;
use crate::error::AudioError;
use crate::volume::{GainRamp, LevelMeter, LEVEL_WINDOW};

const VOLUME_RAMP: Duration = Duration::from_millis(1_500);

struct MixVoice {
  id: VoiceId,
  samples: Arc<Vec<f32>>,
  start_frame: u64,
  pos: usize,
  meter: LevelMeter,
  level: watch::Sender<f32>,
  finished: Option<oneshot::Sender<()>>,
}

/// State shared between the control side and the output callback.
struct Mixer {
  clock: Arc<dyn Clock>,
  sample_rate: u32,
  channels: usize,
  tracks: HashMap<String, Arc<Vec<f32>>>,
  voices: Vec<MixVoice>,
  gain: GainRamp,
  /// Output frames rendered so far, and the local time of the last render.
  frames: u64,
  frames_at_ms: i64,
}

impl Mixer {
  /// Output frame that will sound at local time `deadline_ms`.
  fn frame_at(&self, deadline_ms: i64) -> u64 {
    let ahead_ms = (deadline_ms - self.clock.now_ms()).max(0) as u64;
    let elapsed_ms = (self.clock.now_ms() - self.frames_at_ms).max(0) as u64;
    let rate = self.sample_rate as u64;
    let now_frame = self.frames + elapsed_ms * rate / 1_000;
    now_frame + ahead_ms * rate / 1_000
  }

  fn render<T>(&mut self, data: &mut [T])
  where
    T: SizedSample + FromSample<f32>,
  {
    let channels = self.channels.max(1);
    let first = self.frames;
    for (i, frame) in data.chunks_mut(channels).enumerate() {
      let at = first + i as u64;
      let mut mix = 0.0f32;
      for v in self.voices.iter_mut() {
        if at >= v.start_frame && v.pos < v.samples.len() {
          mix += v.samples[v.pos];
          v.pos += 1;
        }
      }
      let out = T::from_sample((mix * self.gain.next_gain()).clamp(-1.0, 1.0));
      for s in frame.iter_mut() {
        *s = out;
      }
    }
    let rendered = (data.len() / channels) as u64;
    self.frames += rendered;
    self.frames_at_ms = self.clock.now_ms();

    let end = self.frames;
    for v in self.voices.iter_mut() {
      if v.start_frame >= end {
        continue;
      }
      let played = (end - v.start_frame.max(first)) as usize;
      let from = v.pos.saturating_sub(played);
      v.meter.add_samples(&v.samples[from..v.pos]);
      v.level.send_replace(v.meter.level());
    }
    self.voices.retain_mut(|v| {
      if v.pos < v.samples.len() {
        return true;
      }
      v.level.send_replace(0.0);
      if let Some(done) = v.finished.take() {
        let _ = done.send(());
      }
      false
    });
  }
}

/// Mixes preloaded mono f32 tracks onto the default output device, duplicated
/// across its channels. Tracks must already be at the device sample rate.
pub struct CpalPlayback {
  mixer: Arc<Mutex<Mixer>>,
  shutdown: Option<mpsc::Sender<()>>,
  thread: Option<std::thread::JoinHandle<()>>,
}

impl CpalPlayback {
  /// Opens the default output device. The stream lives on its own thread.
  pub fn open(clock: Arc<dyn Clock>) -> Result<Self, AudioError> {
    let (ready_tx, ready_rx) = mpsc::channel();
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let thread = std::thread::spawn(move || {
      let opened = open_stream(clock);
      let (mixer, stream) = match opened {
        Ok(ok) => ok,
        Err(e) => {
          let _ = ready_tx.send(Err(e));
          return;
        }
      };
      let _ = ready_tx.send(Ok(mixer));
      // keep the stream alive until shutdown or the owner goes away
      let _ = shutdown_rx.recv();
      drop(stream);
    });

    let mixer = ready_rx
      .recv()
      .map_err(|_| AudioError::Backend("audio thread exited during setup".into()))??;
    Ok(Self { mixer, shutdown: Some(shutdown_tx), thread: Some(thread) })
  }

  fn mixer(&self) -> MutexGuard<'_, Mixer> {
    self.mixer.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn open_stream(clock: Arc<dyn Clock>) -> Result<(Arc<Mutex<Mixer>>, cpal::Stream), AudioError> {
  let host = cpal::default_host();
  let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
  let supported = device
    .default_output_config()
    .map_err(|e| AudioError::Backend(e.to_string()))?;
  let config = supported.config();
  info!(
    device = ?device.name().ok(),
    sample_rate = config.sample_rate.0,
    channels = config.channels,
    format = ?supported.sample_format(),
    "audio output opened"
  );

  let now_ms = clock.now_ms();
  let mixer = Arc::new(Mutex::new(Mixer {
    clock,
    sample_rate: config.sample_rate.0,
    channels: config.channels as usize,
    tracks: HashMap::new(),
    voices: Vec::new(),
    gain: GainRamp::new(1.0),
    frames: 0,
    frames_at_ms: now_ms,
  }));

  let stream = match supported.sample_format() {
    cpal::SampleFormat::F32 => build_output_stream::<f32>(&device, &config, mixer.clone())?,
    cpal::SampleFormat::I16 => build_output_stream::<i16>(&device, &config, mixer.clone())?,
    cpal::SampleFormat::U16 => build_output_stream::<u16>(&device, &config, mixer.clone())?,
    other => {
      return Err(AudioError::Backend(format!("unsupported sample format: {other:?}")));
    }
  };
  stream.play().map_err(|e| AudioError::Backend(e.to_string()))?;
  Ok((mixer, stream))
}

fn build_output_stream<T>(
  device: &cpal::Device,
  config: &cpal::StreamConfig,
  mixer: Arc<Mutex<Mixer>>,
) -> Result<cpal::Stream, AudioError>
where
  T: SizedSample + FromSample<f32>,
{
  let err_fn = |err| error!("output stream error: {err}");
  device
    .build_output_stream(
      config,
      move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
        match mixer.lock() {
          Ok(mut m) => m.render(data),
          Err(_) => data.fill(T::EQUILIBRIUM),
        }
      },
      err_fn,
      None,
    )
    .map_err(|e| AudioError::Backend(e.to_string()))
}

impl AudioPlayback for CpalPlayback {
  fn start_at(&self, track: &str, deadline_ms: i64) -> Result<Voice, AudioError> {
    let mut m = self.mixer();
    let samples = m
      .tracks
      .get(track)
      .cloned()
      .ok_or_else(|| AudioError::NotLoaded(track.to_string()))?;
    let id = VoiceId::next();
    let (level_tx, level) = watch::channel(0.0f32);
    let (finished_tx, finished) = oneshot::channel();
    let start_frame = m.frame_at(deadline_ms);
    m.voices.push(MixVoice {
      id,
      samples,
      start_frame,
      pos: 0,
      meter: LevelMeter::new(LEVEL_WINDOW),
      level: level_tx,
      finished: Some(finished_tx),
    });
    debug!(%id, track, deadline_ms, start_frame, "voice queued");
    Ok(Voice { id, level, finished })
  }

  fn stop(&self, id: VoiceId) {
    self.mixer().voices.retain(|v| v.id != id);
  }

  fn preload(&self, name: &str, bytes: &[u8]) -> Result<(), AudioError> {
    let samples = Arc::new(pcm_from_bytes(bytes));
    self.mixer().tracks.insert(name.to_string(), samples);
    Ok(())
  }

  fn unload(&self, name: &str) {
    self.mixer().tracks.remove(name);
  }

  fn set_volume(&self, level: f32) {
    let mut m = self.mixer();
    let frames = (m.sample_rate as u64 * VOLUME_RAMP.as_millis() as u64 / 1_000) as u32;
    m.gain.ramp_to(level, frames);
  }
}

impl Drop for CpalPlayback {
  fn drop(&mut self) {
    self.mixer().voices.clear();
    self.shutdown.take();
    if let Some(thread) = self.thread.take() {
      let _ = thread.join();
    }
  }
}
