#[cfg(feature = "cpal")]
pub mod cpal;
pub mod silent;

#[cfg(feature = "cpal")]
pub use cpal::CpalPlayback;
pub use silent::SilentPlayback;
