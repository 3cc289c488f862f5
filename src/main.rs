//! Demo entry point — voice-bridge.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`BridgeConfig`] from disk (returns default on first run).
//! 3. Build the controller over the cpal backend and the built-in PCM
//!    decoder.
//! 4. Initialise the output pipeline and start recording with a sink that
//!    prints per-chunk stats.
//! 5. Capture for a few seconds, then play a generated tone back through
//!    `queue_model_audio`.
//! 6. Clean up.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use voice_bridge::{
    audio::encoder::AudioChunk,
    config::BridgeConfig,
    device::{CpalBackend, CpalOutputFactory},
    pipeline::BridgeController,
    playback::PcmDecoder,
};

const CAPTURE_SECS: u64 = 5;

/// 0.5 s 440 Hz sine as little-endian PCM16 at `sample_rate`.
fn tone_payload(sample_rate: u32) -> Vec<u8> {
    let samples = sample_rate / 2;
    let mut payload = Vec::with_capacity(samples as usize * 2);
    for n in 0..samples {
        let t = f64::from(n) / f64::from(sample_rate);
        let s = (t * 440.0 * std::f64::consts::TAU).sin() * 0.3;
        let v = (s * 32767.0) as i16;
        payload.extend_from_slice(&v.to_le_bytes());
    }
    payload
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = BridgeConfig::load()?;
    let decode_rate = config.playback.decode_sample_rate;
    let default_rate = config.playback.default_rate;

    let backend = match &config.audio.preferred_device {
        Some(name) => CpalBackend::with_device(name.clone()),
        None => CpalBackend::new(),
    };

    let mut controller = BridgeController::new(
        Arc::new(backend),
        Arc::new(CpalOutputFactory),
        Arc::new(PcmDecoder::new(decode_rate)),
        config,
    );

    controller.initialize_contexts()?;

    let sink = Box::new(|chunk: &AudioChunk| -> Result<()> {
        println!(
            "chunk: {:7.1} ms  rms {:7.1}  {}",
            chunk.duration_ms,
            chunk.rms,
            if chunk.is_speaking { "speech" } else { "silence" }
        );
        Ok(())
    });

    let diag = controller.start_recording(sink).await?;
    println!(
        "recording: {} stage (fallback={}), {} path",
        diag.applied_stage.label(),
        diag.fallback_applied,
        diag.path.label()
    );

    tokio::time::sleep(Duration::from_secs(CAPTURE_SECS)).await;
    if let Some(metrics) = controller.stop_recording() {
        println!("captured {:.0} ms of audio", metrics.segment_ms);
    }

    let ms = controller
        .queue_model_audio(&tone_payload(decode_rate), default_rate)
        .await;
    println!("playing a {ms:.0} ms tone");
    tokio::time::sleep(Duration::from_millis(ms as u64 + 200)).await;

    controller.cleanup();
    Ok(())
}
