//! voice-bridge — bidirectional real-time audio pipeline.
//!
//! Outbound: the microphone is negotiated through a four-stage constraint
//! ladder, frames flow through a low-latency or periodic processing path,
//! and each buffer becomes a 16 kHz mono PCM16 [`audio::encoder::AudioChunk`]
//! with a per-chunk voice-activity signal, delivered to an injected
//! [`pipeline::ChunkSink`].
//!
//! Inbound: encoded payloads are decoded by an [`playback::AudioDecoder`]
//! and placed back to back on the output device's timeline by the
//! [`playback::PlaybackScheduler`].
//!
//! ```text
//!          ┌────────────── outbound ──────────────┐
//! mic ──▶ ladder ──▶ path ──▶ frames ──▶ encoder/VAD ──▶ ChunkSink
//!
//!          ┌────────────── inbound ───────────────┐
//! payload ──▶ AudioDecoder ──▶ scheduler ──▶ OutputSink ──▶ speaker
//! ```
//!
//! [`pipeline::BridgeController`] owns the whole lifecycle; the `device`
//! module seams out the platform engine (cpal in production, mocks in
//! tests).

pub mod audio;
pub mod config;
pub mod device;
pub mod pipeline;
pub mod playback;
