use crate::packet::SyncDecodeError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("transport error: {0}")]
  Transport(String),
  #[error("audio error: {0}")]
  Audio(#[from] AudioError),
  #[error("config error: {0}")]
  Config(#[from] toml::de::Error),
  #[error("decode error: {0}")]
  Decode(#[from] SyncDecodeError),
  #[error("track data error: {0}")]
  TrackData(#[from] serde_json::Error),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("task failed: {0}")]
  Task(#[from] tokio::task::JoinError),
}

/// Failures reported by an audio playback backend.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
  #[error("track not loaded: {0}")]
  NotLoaded(String),
  #[error("no audio output device available")]
  NoDevice,
  #[error("audio backend failure: {0}")]
  Backend(String),
}
