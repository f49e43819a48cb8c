mod common;

use common::{FixedLink, Recorder};
use conductor::clock::{Clock, LocalClock};
use conductor::config::SyncConfig;
use conductor::scheduler::{Feedback, PlaybackScheduler};
use conductor::session::SyncSession;
use conductor::sync_controller::EstimatorState;
use conductor::transport::ServerEvent;
use conductor::{AudioError, Error};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

struct Rig {
  clock: LocalClock,
  link: Arc<FixedLink>,
  audio: Arc<Recorder>,
  session: Arc<SyncSession>,
  scheduler: Arc<PlaybackScheduler>,
}

fn rig(audio: impl FnOnce(LocalClock) -> Recorder) -> Rig {
  let clock = LocalClock::starting_at(1_000_000);
  let link = Arc::new(FixedLink::new(clock, 5, 30));
  let audio = Arc::new(audio(clock));
  let config = SyncConfig::default();
  let session = Arc::new(SyncSession::new(config.clone(), link.clone(), Arc::new(clock)));
  let scheduler = Arc::new(PlaybackScheduler::new(audio.clone(), Arc::new(clock), &config));
  Rig { clock, link, audio, session, scheduler }
}

fn playing_for(ms: u64) -> impl FnOnce(LocalClock) -> Recorder {
  move |clock| Recorder::new(clock, Duration::from_millis(ms))
}

#[tokio::test(start_paused = true)]
async fn fires_at_target_minus_skew() {
  let clock = LocalClock::starting_at(1_000);
  let audio = Arc::new(Recorder::new(clock, Duration::from_millis(300)));
  let scheduler = Arc::new(PlaybackScheduler::new(audio.clone(), Arc::new(clock), &SyncConfig::default()));

  let run = {
    let scheduler = scheduler.clone();
    tokio::spawn(async move { scheduler.play_at("clap", 5_000, 30).await })
  };
  sleep(Duration::from_millis(500)).await;
  assert_eq!(scheduler.armed_deadline(), Some(4_970));
  assert_eq!(*scheduler.feedback().borrow(), Feedback::Countdown { seconds: 3 });
  assert!(audio.starts().is_empty());

  run.await.unwrap().unwrap();
  let starts = audio.starts();
  assert_eq!(starts.len(), 1);
  assert_eq!(starts[0].track, "clap");
  assert_eq!(starts[0].deadline_ms, 4_970);
  assert_eq!(starts[0].at_ms, 4_970);
  assert_eq!(clock.now_ms(), 5_270);
  assert_eq!(scheduler.armed_deadline(), None);
  assert_eq!(*scheduler.feedback().borrow(), Feedback::Idle);
  assert!(audio.stopped().is_empty());
}

#[tokio::test(start_paused = true)]
async fn past_deadline_starts_immediately() {
  let clock = LocalClock::starting_at(1_000);
  let audio = Arc::new(Recorder::new(clock, Duration::from_millis(10)));
  let scheduler = PlaybackScheduler::new(audio.clone(), Arc::new(clock), &SyncConfig::default());
  scheduler.play_at("clap", 1_500, 1_000).await.unwrap();
  let starts = audio.starts();
  assert_eq!(starts[0].deadline_ms, 500);
  assert_eq!(starts[0].at_ms, 1_000);
}

#[tokio::test(start_paused = true)]
async fn cycle_settles_and_rearms_without_resampling() {
  let r = rig(playing_for(400));
  r.session.start();
  let task = r.scheduler.spawn(r.session.clone(), "clap".into());
  assert_eq!(r.session.resolved_skew().await, 30);
  let probes = r.link.probes();

  let target = r.clock.now_ms() + 2_000;
  assert!(r.session.on_schedule_push(target));
  // a pending schedule wins over later pushes
  assert!(!r.session.on_schedule_push(target + 5_000));

  // countdown, 400ms of audio, settle
  sleep(Duration::from_millis(2_000 + 400 + 2_000 + 50)).await;
  assert_eq!(r.scheduler.completed_cycles(), 1);
  assert_eq!(r.session.pending_schedule(), None);
  assert_eq!(r.audio.starts()[0].at_ms, target - 30);

  let target = r.clock.now_ms() + 1_000;
  assert!(r.session.on_schedule_push(target));
  sleep(Duration::from_millis(1_000 + 400 + 2_000 + 50)).await;
  assert_eq!(r.scheduler.completed_cycles(), 2);
  assert_eq!(r.audio.starts()[1].deadline_ms, target - 30);
  assert_eq!(r.audio.starts()[1].at_ms, target - 30);

  assert_eq!(r.link.probes(), probes);
  assert!(r.audio.stopped().is_empty());
  task.cancel().await;
}

#[tokio::test(start_paused = true)]
async fn audio_start_failure_is_surfaced() {
  let r = rig(Recorder::failing);
  r.session.start();
  let task = r.scheduler.spawn(r.session.clone(), "clap".into());
  r.session.resolved_skew().await;
  r.session.on_schedule_push(r.clock.now_ms() + 1_000);

  let err = task.join().await.unwrap_err();
  assert!(matches!(err, Error::Audio(AudioError::Backend(_))), "{err}");
  assert_eq!(r.session.pending_schedule(), None);
  assert_eq!(r.scheduler.active_voices(), 0);
  assert_eq!(r.scheduler.armed_deadline(), None);
  assert_eq!(*r.scheduler.feedback().borrow(), Feedback::Idle);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_countdown_never_starts() {
  let r = rig(playing_for(400));
  r.session.start();
  let task = r.scheduler.spawn(r.session.clone(), "clap".into());
  r.session.resolved_skew().await;
  let mut armed = r.scheduler.subscribe_armed();
  let target = r.clock.now_ms() + 3_000;
  r.session.on_schedule_push(target);

  let deadline = *armed.wait_for(Option::is_some).await.unwrap();
  assert_eq!(deadline, Some(target - 30));
  sleep(Duration::from_millis(1_000)).await;
  task.cancel().await;
  assert!(armed.has_changed().unwrap());
  assert_eq!(r.scheduler.armed_deadline(), None);

  sleep(Duration::from_millis(5_000)).await;
  assert!(r.audio.starts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_task_stops_the_playing_voice() {
  let r = rig(playing_for(10_000));
  r.session.start();
  let task = r.scheduler.spawn(r.session.clone(), "clap".into());
  r.session.resolved_skew().await;
  r.session.on_schedule_push(r.clock.now_ms() + 500);

  sleep(Duration::from_millis(1_000)).await;
  assert_eq!(r.scheduler.active_voices(), 1);
  assert!(matches!(*r.scheduler.feedback().borrow(), Feedback::Playing { .. }));
  let id = r.audio.starts()[0].id;

  drop(task);
  assert_eq!(r.audio.stopped(), vec![id]);
  assert_eq!(r.scheduler.active_voices(), 0);
  assert_eq!(*r.scheduler.feedback().borrow(), Feedback::Idle);
}

#[tokio::test(start_paused = true)]
async fn volume_pushes_are_clamped() {
  let r = rig(playing_for(10));
  r.session.handle_event(ServerEvent::Volume { level: 1.7 }, r.audio.as_ref());
  assert_eq!(r.audio.volume(), Some(1.0));
  r.session.handle_event(ServerEvent::Schedule { time_ms: 42 }, r.audio.as_ref());
  assert_eq!(r.session.pending_schedule(), Some(42));
}

#[tokio::test(start_paused = true)]
async fn clearing_the_schedule_has_no_other_effect() {
  let r = rig(playing_for(10));
  assert!(!r.session.clear_scheduled_time());
  assert!(r.session.on_schedule_push(5_000));
  assert!(r.session.clear_scheduled_time());
  assert_eq!(r.session.pending_schedule(), None);

  sleep(Duration::from_millis(500)).await;
  assert_eq!(r.session.state(), EstimatorState::Idle);
  assert_eq!(r.link.probes(), 0);
  // the slot takes a fresh push afterwards
  assert!(r.session.on_schedule_push(6_000));
  assert_eq!(r.session.pending_schedule(), Some(6_000));
}
