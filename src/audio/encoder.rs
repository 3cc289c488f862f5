//! PCM encoding and energy-based voice-activity detection.
//!
//! Every buffer leaving the capture pipeline passes through this module:
//!
//! ```text
//! f32 frame → float_to_int16 → rms → classify_speech → AudioChunk
//! ```
//!
//! All functions are pure and stateless; a failed conversion can never
//! corrupt the pipeline because nothing here holds state across calls.
//!
//! # Example
//!
//! ```rust
//! use voice_bridge::audio::encoder::{build_chunk, PCM_MIME};
//!
//! // 2048 samples @ 16 kHz = 128 ms
//! let frame = vec![0.05_f32; 2048];
//! let chunk = build_chunk(&frame, 400.0);
//! assert_eq!(chunk.mime_type, PCM_MIME);
//! assert!((chunk.duration_ms - 128.0).abs() < 1e-3);
//! ```

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Mime type carried by every outbound chunk.
///
/// Both processing paths deliver 16 kHz mono, so this literal is fixed
/// regardless of which path produced the buffer.
pub const PCM_MIME: &str = "audio/pcm;rate=16000";

/// Capture rate the whole outbound pipeline is normalised to, in Hz.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Default RMS threshold (in i16 sample units) above which a chunk is
/// classified as containing speech.
pub const SPEECH_RMS_THRESHOLD: f32 = 400.0;

// ---------------------------------------------------------------------------
// AudioChunk
// ---------------------------------------------------------------------------

/// One encoded buffer ready for the outbound chunk sink.
///
/// Transient value: produced per processed buffer and handed to the sink
/// immediately; the pipeline never retains chunks.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// PCM16 samples, 16 kHz mono.
    pub samples: Vec<i16>,
    /// Always [`PCM_MIME`].
    pub mime_type: &'static str,
    /// `true` when the chunk's RMS exceeded the speech threshold.
    pub is_speaking: bool,
    /// Duration represented by `samples` at 16 kHz, in milliseconds.
    pub duration_ms: f32,
    /// RMS energy of `samples` in i16 units.
    pub rms: f32,
}

impl AudioChunk {
    /// Little-endian byte payload for network transport.
    pub fn payload(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }
}

// ---------------------------------------------------------------------------
// Conversion / VAD primitives
// ---------------------------------------------------------------------------

/// Convert `f32` samples in `[-1.0, 1.0]` to PCM16.
///
/// Samples are clamped first, then negative values scale by 32768 and
/// non-negative values by 32767.  The asymmetry mirrors the two's-complement
/// i16 range and must not be "fixed" — downstream consumers expect exactly
/// this convention, bit for bit.
pub fn float_to_int16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = s.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32_768.0) as i16
            } else {
                (s * 32_767.0) as i16
            }
        })
        .collect()
}

/// Root-mean-square energy over all samples, in i16 units.
///
/// Returns `0.0` for an empty slice.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Classify a buffer as speech.  Strictly greater-than — an RMS of exactly
/// the threshold is silence.
pub fn classify_speech(rms: f32, threshold: f32) -> bool {
    rms > threshold
}

/// Build an [`AudioChunk`] from a 16 kHz mono `f32` frame.
///
/// `duration_ms` is derived from the sample count at the fixed 16 kHz rate;
/// the capture paths guarantee that rate before frames reach the encoder.
pub fn build_chunk(samples: &[f32], vad_threshold: f32) -> AudioChunk {
    let pcm = float_to_int16(samples);
    let energy = rms(&pcm);
    let duration_ms = pcm.len() as f32 / TARGET_SAMPLE_RATE as f32 * 1000.0;

    AudioChunk {
        is_speaking: classify_speech(energy, vad_threshold),
        rms: energy,
        duration_ms,
        mime_type: PCM_MIME,
        samples: pcm,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
