//! Inbound audio decoding seam.
//!
//! The remote service streams encoded audio payloads; an [`AudioDecoder`]
//! turns each payload into a [`DecodedAudio`] buffer the scheduler can place
//! on the output timeline.  Decoding is a suspension point, so the trait is
//! async.  [`PcmDecoder`] covers the common raw-PCM16 case; anything fancier
//! (opus, mp3, …) is supplied by the embedding application.

use async_trait::async_trait;
use thiserror::Error;

// ---------------------------------------------------------------------------
// DecodeError
// ---------------------------------------------------------------------------

/// Why an inbound payload could not be decoded.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("empty audio payload")]
    Empty,

    #[error("malformed audio payload: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// DecodedAudio
// ---------------------------------------------------------------------------

/// A decoded, playable mono buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Mono samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// Sample rate of `samples` in Hz.
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Natural playback duration at rate 1.0, in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

// ---------------------------------------------------------------------------
// AudioDecoder
// ---------------------------------------------------------------------------

/// Decodes one inbound payload.  Implementations must be safe to call
/// concurrently (the trait is `Sync`); the pipeline itself serialises calls
/// through the controller.
#[async_trait]
pub trait AudioDecoder: Send + Sync {
    async fn decode(&self, payload: &[u8]) -> Result<DecodedAudio, DecodeError>;
}

// ---------------------------------------------------------------------------
// PcmDecoder
// ---------------------------------------------------------------------------

/// Decoder for raw little-endian PCM16 payloads at a fixed rate.
pub struct PcmDecoder {
    sample_rate: u32,
}

impl PcmDecoder {
    /// `sample_rate` is the rate the remote service synthesises at
    /// (commonly 24 000 Hz).
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait]
impl AudioDecoder for PcmDecoder {
    async fn decode(&self, payload: &[u8]) -> Result<DecodedAudio, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        if payload.len() % 2 != 0 {
            return Err(DecodeError::Malformed(format!(
                "odd byte count {} for PCM16",
                payload.len()
            )));
        }

        let samples = payload
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32_768.0)
            .collect();

        Ok(DecodedAudio {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
