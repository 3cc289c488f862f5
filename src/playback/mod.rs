//! Playback pipeline — inbound payload → decoder → gapless scheduler →
//! output device.
//!
//! ```text
//! encoded payload → AudioDecoder → DecodedAudio
//!                 → PlaybackScheduler (timeline cursor) → OutputSink
//! ```

pub mod decode;
pub mod scheduler;

pub use decode::{AudioDecoder, DecodeError, DecodedAudio, PcmDecoder};
pub use scheduler::{PlaybackError, PlaybackScheduler};
