//! Gapless output-timeline scheduling.
//!
//! Streamed responses arrive as variable-length decoded segments.  The
//! scheduler keeps a single cursor — the next free position on the output
//! clock — and places each segment exactly there, so consecutive segments
//! play back to back with no gap and no overlap.  Gaplessness comes purely
//! from this cursor arithmetic: segments are independent once scheduled and
//! an enqueue never waits on a previous segment.
//!
//! ```text
//! cursor = max(cursor, clock)          // heal drift after the queue drains
//! schedule(segment, start = cursor)
//! cursor += duration / rate
//! ```
//!
//! The cursor only ever moves backward on [`PlaybackScheduler::stop_all`],
//! which is a full stop, never a mid-stream correction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::device::{OutputSink, ScheduledSegment};
use crate::playback::decode::{DecodeError, DecodedAudio};

// ---------------------------------------------------------------------------
// PlaybackError
// ---------------------------------------------------------------------------

/// Why a segment could not be scheduled.  Per-enqueue: one failure never
/// affects segments already on the timeline.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("output sink error: {0}")]
    Sink(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

// ---------------------------------------------------------------------------
// PlaybackScheduler
// ---------------------------------------------------------------------------

/// Live-segment slot.  `None` marks a segment whose ended signal fired
/// before its handle was registered (the sink may complete synchronously).
type SegmentSlot = Option<Box<dyn ScheduledSegment>>;

/// Schedules decoded segments back to back on an [`OutputSink`].
///
/// Single-writer: all enqueues must go through one logical owner (the
/// controller serialises them), so the cursor needs no internal lock of its
/// own.  The live-segment set is shared with the sink's ended callbacks and
/// is the only locked state.
pub struct PlaybackScheduler {
    sink: Arc<dyn OutputSink>,
    next_start_secs: f64,
    live: Arc<Mutex<HashMap<u64, SegmentSlot>>>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            next_start_secs: 0.0,
            live: Arc::new(Mutex::new(HashMap::new())),
            next_id: 0,
        }
    }

    /// Place `audio` at the next free position on the timeline.
    ///
    /// `rate` ≤ 0 is coerced to 1.0.  Returns the scheduled duration in
    /// milliseconds (`natural duration / rate`) so the caller can track
    /// elapsed playback externally.
    pub fn enqueue(&mut self, audio: DecodedAudio, rate: f64) -> Result<f64, PlaybackError> {
        let rate = if rate <= 0.0 { 1.0 } else { rate };
        let scheduled_secs = audio.duration_secs() / rate;

        // Heal drift: if the queue emptied and the clock ran past the last
        // scheduled end, the next segment starts now, not in the past.
        let clock = self.sink.clock_secs();
        if clock > self.next_start_secs {
            self.next_start_secs = clock;
        }
        let start = self.next_start_secs;

        let id = self.next_id;
        self.next_id += 1;

        // Register the slot before scheduling so an ended signal that fires
        // synchronously finds (and removes) it.
        self.live.lock().unwrap().insert(id, None);

        let live = Arc::clone(&self.live);
        let on_ended = Box::new(move || {
            live.lock().unwrap().remove(&id);
        });

        let segment = match self.sink.schedule(audio, start, rate, on_ended) {
            Ok(segment) => segment,
            Err(err) => {
                self.live.lock().unwrap().remove(&id);
                return Err(err);
            }
        };

        // Store the handle unless the segment already ended.
        if let Some(slot) = self.live.lock().unwrap().get_mut(&id) {
            *slot = Some(segment);
        }

        self.next_start_secs = start + scheduled_secs;
        log::debug!(
            "scheduled {scheduled_secs:.3}s segment at t={start:.3}s (rate {rate})"
        );
        Ok(scheduled_secs * 1000.0)
    }

    /// Stop every live segment, clear the set, and reset the cursor to 0.
    ///
    /// The only operation that moves the cursor backward.
    pub fn stop_all(&mut self) {
        let mut live = self.live.lock().unwrap();
        let count = live.len();
        for (_, slot) in live.drain() {
            if let Some(mut segment) = slot {
                segment.stop();
            }
        }
        drop(live);

        self.next_start_secs = 0.0;
        if count > 0 {
            log::debug!("stopped {count} live playback segment(s)");
        }
    }

    /// Segments scheduled and not yet ended.
    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Where the next segment would start, in seconds on the output clock.
    pub fn next_start_secs(&self) -> f64 {
        self.next_start_secs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
