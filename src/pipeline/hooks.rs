//! The pipeline's outward-facing callback surfaces.
//!
//! Two seams connect the pipeline to its host application: [`ChunkSink`]
//! receives every outbound audio chunk in capture order, and
//! [`LifecycleHooks`] observes session transitions.  Both are injected so
//! the library stays transport-agnostic.

use std::time::SystemTime;

use crate::audio::encoder::AudioChunk;

// ---------------------------------------------------------------------------
// ChunkSink
// ---------------------------------------------------------------------------

/// Consumer of outbound audio chunks.
///
/// Called once per processed capture buffer, on the pump thread, in FIFO
/// order.  A returned error is per-chunk: the chunk is logged and dropped,
/// the session keeps running.
pub trait ChunkSink: Send {
    fn on_chunk(&mut self, chunk: &AudioChunk) -> anyhow::Result<()>;
}

/// Closures work directly as sinks.
impl<F> ChunkSink for F
where
    F: FnMut(&AudioChunk) -> anyhow::Result<()> + Send,
{
    fn on_chunk(&mut self, chunk: &AudioChunk) -> anyhow::Result<()> {
        self(chunk)
    }
}

// ---------------------------------------------------------------------------
// LifecycleHooks
// ---------------------------------------------------------------------------

/// What one recording segment amounted to.
#[derive(Debug, Clone)]
pub struct RecordingMetrics {
    pub started_at: SystemTime,
    pub stopped_at: SystemTime,
    /// Wall-clock length of the segment in milliseconds.
    pub segment_ms: f64,
}

/// Observer for session transitions.  Every method has an empty default so
/// implementors override only what they care about; each fires at most once
/// per transition.
pub trait LifecycleHooks: Send + Sync {
    fn on_start(&self, _started_at: SystemTime) {}
    fn on_stop(&self, _metrics: &RecordingMetrics) {}
    fn on_error(&self, _message: &str) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
