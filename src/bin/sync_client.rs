use anyhow::{anyhow, bail, Context, Result};
use conductor::audio::AudioPlayback;
use conductor::clock::{Clock, LocalClock};
use conductor::config::SyncConfig;
use conductor::preload::TrackLoader;
use conductor::scheduler::{Feedback, PlaybackScheduler};
use conductor::session::SyncSession;
use conductor::sync_controller::EstimatorState;
use conductor::track::{assemble_track, Chunk, Track};
use conductor::transport::UdpTransport;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const STATUS_REFRESH: Duration = Duration::from_millis(100);
const TONE_RATE: u32 = 48_000;

struct Args {
  server: String,
  config: Option<PathBuf>,
  floor_ms: Option<i64>,
  track: Option<PathBuf>,
}

fn usage(prog: &str) {
  eprintln!(
    "Usage: {} <server_addr:port> [--config <path>] [--floor <ms>] [--track <file>]",
    prog
  );
  eprintln!("Example: {} 192.168.1.20:4810 --floor 2", prog);
  eprintln!("Track files: raw f32le mono PCM, or .json with {{\"track\":...,\"chunks\":[...]}}");
  eprintln!("Ctrl-D stops sampling early, Ctrl-C quits.");
}

fn parse_args() -> Result<Option<Args>> {
  let mut args = env::args();
  let prog = args.next().unwrap_or_else(|| "conductor-client".into());
  let mut server = None;
  let mut config = None;
  let mut floor_ms = None;
  let mut track = None;
  while let Some(arg) = args.next() {
    let mut value = |flag: &str| args.next().ok_or_else(|| anyhow!("{flag} needs a value"));
    match arg.as_str() {
      "--config" => config = Some(PathBuf::from(value("--config")?)),
      "--floor" => {
        let v = value("--floor")?;
        floor_ms = Some(v.parse().with_context(|| format!("invalid --floor: {v}"))?);
      }
      "--track" => track = Some(PathBuf::from(value("--track")?)),
      "-h" | "--help" => {
        usage(&prog);
        return Ok(None);
      }
      s if s.starts_with('-') => bail!("unknown flag: {}", s),
      s => {
        if server.is_some() {
          bail!("unexpected argument: {}", s);
        }
        server = Some(s.to_string());
      }
    }
  }
  let Some(server) = server else {
    usage(&prog);
    bail!("missing server address");
  };
  Ok(Some(Args { server, config, floor_ms, track }))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .with_writer(std::io::stderr)
    .init();

  let Some(args) = parse_args()? else {
    return Ok(());
  };

  // deadline timers are driven from this thread
  boost_current_thread_priority();
  let runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()
    .context("failed to start runtime")?;
  runtime.block_on(run(args))
}

fn boost_current_thread_priority() {
  use thread_priority::{set_current_thread_priority, ThreadPriority};
  match set_current_thread_priority(ThreadPriority::Max) {
    Ok(()) => info!("raised scheduler thread priority"),
    Err(e) => warn!("could not raise thread priority: {e:?}"),
  }
}

async fn run(args: Args) -> Result<()> {
  // 1. Configuration
  let mut config = match &args.config {
    Some(path) => SyncConfig::load(path).with_context(|| format!("failed to load {}", path.display()))?,
    None => SyncConfig::default(),
  };
  if let Some(floor) = args.floor_ms {
    config = config.with_one_way_floor(floor);
  }

  // 2. Clock, transport and audio backend
  let clock: Arc<dyn Clock> = Arc::new(LocalClock::new());
  let (transport, mut events) = UdpTransport::connect(args.server.as_str())
    .await
    .with_context(|| format!("failed to reach {}", args.server))?;
  info!(local = %transport.local_addr()?, server = %args.server, "connected");
  let audio = open_audio(clock.clone())?;

  // 3. Load the track before anything can fire
  let (name, bytes) = match &args.track {
    Some(path) => read_track(path)?,
    None => ("tone".to_string(), tone_pcm(440.0, Duration::from_millis(800))),
  };
  let mut loader = TrackLoader::new(audio.clone());
  let mut loaded = loader.subscribe();
  loader.select(&name, bytes);
  tokio::time::timeout(Duration::from_secs(30), loaded.wait_for(Option::is_some))
    .await
    .context("timed out loading the track")?
    .context("track loader went away")?;
  info!(track = %name, "track ready");

  // 4. Session: sampling starts now, schedule pushes arrive on `events`
  let session = Arc::new(SyncSession::new(config.clone(), Arc::new(transport), clock.clone()));
  session.start();
  let scheduler = Arc::new(PlaybackScheduler::new(audio.clone(), clock.clone(), &config));
  let task = scheduler.spawn(session.clone(), name);

  let pushes = {
    let session = session.clone();
    let audio = audio.clone();
    tokio::spawn(async move {
      while let Some(event) = events.recv().await {
        session.handle_event(event, audio.as_ref());
      }
    })
  };

  let stdin = {
    let session = session.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      while let Ok(Some(_)) = lines.next_line().await {}
      if session.state() != EstimatorState::Finalized {
        info!("stdin closed, finishing sampling with what we have");
      }
      session.cancel();
    })
  };

  // 5. Status line until Ctrl-C or the scheduler gives up
  let feedback = scheduler.feedback();
  let mut refresh = tokio::time::interval(STATUS_REFRESH);
  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);
  let interrupted = loop {
    tokio::select! {
      _ = &mut ctrl_c => break true,
      _ = refresh.tick() => {
        if task.is_finished() {
          break false;
        }
        let line = status_line(&session, *feedback.borrow(), scheduler.completed_cycles());
        eprint!("\r\x1b[2K{}", line);
      }
    }
  };
  eprint!("\r\x1b[2K\n");

  pushes.abort();
  stdin.abort();
  if !interrupted {
    return task.join().await.context("playback stopped");
  }
  task.cancel().await;
  loader.release();
  info!("stopped");
  Ok(())
}

fn status_line(session: &SyncSession, feedback: Feedback, cycles: u64) -> String {
  let controller = session.controller();
  let sync = match (session.state(), controller.skew()) {
    (_, Some(skew)) => format!("skew {:+}ms", skew),
    (EstimatorState::Sampling, None) => format!("sampling ({} kept)", controller.sample_count()),
    (_, None) => "waiting to sample".to_string(),
  };
  let play = match feedback {
    Feedback::Idle => match session.pending_schedule() {
      Some(t) => format!("scheduled at {t}"),
      None => "waiting for schedule".to_string(),
    },
    Feedback::Countdown { seconds } => format!("starting in {seconds}s"),
    Feedback::Playing { level } => format!("playing {}", level_bar(level)),
  };
  format!("{sync} | {play} | cycles {cycles}")
}

fn level_bar(level: f32) -> String {
  const WIDTH: usize = 20;
  let filled = ((level.clamp(0.0, 1.0) * WIDTH as f32).round() as usize).min(WIDTH);
  format!("[{}{}]", "#".repeat(filled), " ".repeat(WIDTH - filled))
}

#[cfg(feature = "cpal")]
fn open_audio(clock: Arc<dyn Clock>) -> Result<Arc<dyn AudioPlayback>> {
  let audio = conductor::output::CpalPlayback::open(clock).context("failed to open audio output")?;
  Ok(Arc::new(audio))
}

#[cfg(not(feature = "cpal"))]
fn open_audio(clock: Arc<dyn Clock>) -> Result<Arc<dyn AudioPlayback>> {
  warn!("built without an audio backend, playing silently");
  Ok(Arc::new(conductor::output::SilentPlayback::new(clock, TONE_RATE)))
}

#[derive(Deserialize)]
struct TrackFile {
  track: Track,
  chunks: Vec<Chunk>,
}

fn read_track(path: &Path) -> Result<(String, Vec<u8>)> {
  let raw = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
  if path.extension().is_some_and(|e| e == "json") {
    let file: TrackFile = serde_json::from_slice(&raw).context("invalid track file")?;
    let bytes = assemble_track(&file.track, &file.chunks)?
      .ok_or_else(|| anyhow!("track {} is incomplete", file.track.name))?;
    return Ok((file.track.name, bytes));
  }
  let name = path
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_else(|| "track".to_string());
  Ok((name, raw))
}

/// Short sine burst with a fade-out, as little-endian f32 mono PCM.
fn tone_pcm(freq: f32, length: Duration) -> Vec<u8> {
  let n = (TONE_RATE as f64 * length.as_secs_f64()) as usize;
  (0..n)
    .flat_map(|i| {
      let t = i as f32 / TONE_RATE as f32;
      let fade = 1.0 - i as f32 / n as f32;
      (0.5 * fade * (std::f32::consts::TAU * freq * t).sin()).to_le_bytes()
    })
    .collect()
}
