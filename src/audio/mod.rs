//! Capture pipeline — constraint ladder → capture session → processing path
//! → encoder/VAD.
//!
//! # Pipeline
//!
//! ```text
//! Microphone → ConstraintLadder → CaptureSession
//!            → (LowLatencyPath | PeriodicCallbackPath) → f32 frames (mpsc)
//!            → encoder (f32→i16, RMS, VAD) → AudioChunk → chunk sink
//! ```
//!
//! The ladder and session live here; the platform seam they talk to is in
//! [`crate::device`].

pub mod capture;
pub mod constraints;
pub mod encoder;
pub mod path;
pub mod resample;

pub use capture::CaptureSession;
pub use constraints::{AcquireError, CaptureRequest, ConstraintStage, StageName, STAGES};
pub use encoder::{build_chunk, AudioChunk, PCM_MIME, TARGET_SAMPLE_RATE};
pub use path::{ModuleGuard, PathKind, ProcessingPath, SetupError};
pub use resample::{downmix_to_mono, resample, StreamResampler};
