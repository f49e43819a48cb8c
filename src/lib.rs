pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod output;
pub mod packet;
pub mod preload;
pub mod scheduler;
pub mod session;
pub mod slot;
pub mod sync_controller;
pub mod timesync;
pub mod track;
pub mod transport;
pub mod voices;
pub mod volume;

pub use error::{AudioError, Error, Result};
