//! Host-audio backend seam.
//!
//! Everything the pipeline needs from the platform's audio engine is
//! expressed as a small set of traits, so the capture ladder, the path
//! selector and the playback scheduler can be exercised against mocks while
//! production wires in the cpal implementations ([`CpalBackend`],
//! [`CpalOutputSink`]).
//!
//! Capture side:
//!
//! ```text
//! CaptureBackend::acquire ──▶ DeviceStream ──▶ ProcessingNode ──▶ f32 frames
//!                                   │
//!                                   └── MonitorSink (low-latency path only)
//! ```
//!
//! Playback side: [`OutputSink`] exposes the output clock and schedules
//! decoded segments at absolute clock positions; each scheduled segment is
//! represented by a [`ScheduledSegment`] handle until its ended signal fires.

pub mod cpal_backend;
pub mod cpal_output;

#[cfg(test)]
pub mod mock;

use std::sync::mpsc;
use std::sync::Arc;

use async_trait::async_trait;

use crate::audio::constraints::{AcquireError, CaptureRequest};
use crate::audio::path::SetupError;
use crate::playback::decode::DecodedAudio;
use crate::playback::scheduler::PlaybackError;

pub use cpal_backend::CpalBackend;
pub use cpal_output::{CpalOutputFactory, CpalOutputSink};

// ---------------------------------------------------------------------------
// Capture traits
// ---------------------------------------------------------------------------

/// A live capture device stream.
///
/// Implementations must answer [`is_live`](Self::is_live) from the *actual*
/// device state, never from a cached flag set at acquisition time — streams
/// die asynchronously (device unplugged, OS revokes access) outside the
/// pipeline's control flow.
pub trait DeviceStream: Send {
    /// Whether the underlying device track is still delivering audio.
    fn is_live(&self) -> bool;

    /// Stop the device track.  Idempotent.
    fn stop(&mut self);

    /// Wire the low-latency processing node onto this stream's source.
    ///
    /// The node forwards each raw buffer, converted to 16 kHz mono `f32`,
    /// into `frames` as soon as the hardware delivers it — buffer sizes vary
    /// with whatever cadence the driver uses.
    fn start_low_latency_node(
        &mut self,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn ProcessingNode>, SetupError>;

    /// Wire the periodic-callback processing node onto this stream's source.
    ///
    /// Frames are accumulated and emitted in fixed `buffer_size`-sample mono
    /// blocks, the cadence the fallback path runs at.
    fn start_periodic_node(
        &mut self,
        buffer_size: usize,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn ProcessingNode>, SetupError>;
}

/// Handle to a running processing node.  Dropping it (or calling
/// [`detach`](Self::detach)) disconnects the node from the stream.
pub trait ProcessingNode: Send {
    fn detach(&mut self);
}

/// Silent sink that keeps the audio engine's scheduling clock pumping while
/// the low-latency path runs.  Must never be audible.
pub trait MonitorSink: Send {
    fn close(&mut self);
}

/// The platform capture engine.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Ask the engine for an input stream matching `request`.
    ///
    /// Suspension point: implementations may prompt for permission or wait
    /// on driver negotiation.
    async fn acquire(&self, request: &CaptureRequest) -> Result<Box<dyn DeviceStream>, AcquireError>;

    /// Whether the engine offers the low-latency off-thread processing
    /// facility at all.  When `false` the selector goes straight to the
    /// periodic-callback path.
    fn supports_low_latency(&self) -> bool;

    /// Install the low-latency processing module.
    ///
    /// Called at most once per process lifetime (guarded by
    /// [`crate::audio::path::ModuleGuard`]).  Suspension point — the capture
    /// stream may die while this runs.
    async fn install_low_latency_module(&self) -> Result<(), SetupError>;

    /// Open the silent monitor sink required by the low-latency path.
    fn open_monitor_sink(&self) -> Result<Box<dyn MonitorSink>, SetupError>;
}

// ---------------------------------------------------------------------------
// Playback traits
// ---------------------------------------------------------------------------

/// Handle to one segment scheduled on the output timeline.
pub trait ScheduledSegment: Send {
    /// Stop playback of this segment immediately.
    fn stop(&mut self);
}

/// The platform output engine.
///
/// The scheduler owns all timeline arithmetic; the sink only needs to play a
/// buffer starting at an absolute clock position and report its clock.
pub trait OutputSink: Send + Sync {
    /// Seconds elapsed on the output clock since the sink was opened.
    fn clock_secs(&self) -> f64;

    /// Schedule `audio` to start at `start_secs` on this sink's clock,
    /// played at `rate` (1.0 = natural speed).  `on_ended` fires exactly
    /// once when the segment finishes naturally; it does not fire when the
    /// segment is stopped through its handle.
    fn schedule(
        &self,
        audio: DecodedAudio,
        start_secs: f64,
        rate: f64,
        on_ended: Box<dyn FnOnce() + Send>,
    ) -> Result<Box<dyn ScheduledSegment>, PlaybackError>;
}

/// Opens the output side on demand so `initialize_contexts` can stay
/// idempotent and lazy.
pub trait OutputFactory: Send + Sync {
    fn open_output(&self) -> Result<Arc<dyn OutputSink>, PlaybackError>;
}
