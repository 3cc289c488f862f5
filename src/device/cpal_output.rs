//! cpal implementation of the playback output sink.
//!
//! One mixer thread owns the (non-`Send`) output stream.  Scheduled segments
//! are pre-resampled to the device rate with the playback rate folded in, so
//! the mixer callback only does frame-indexed addition:
//!
//! ```text
//! schedule(audio, start, rate) ──▶ resample to device rate / rate
//!                              ──▶ ActiveSegment { start_frame, samples }
//! mixer callback: out[frame] = Σ segment.samples[frame - start_frame]
//! ```
//!
//! The sink clock is the number of frames the device has consumed, which is
//! what makes back-to-back scheduling land sample-exact.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::audio::resample::resample;
use crate::playback::decode::DecodedAudio;
use crate::playback::scheduler::PlaybackError;

use super::{OutputFactory, OutputSink, ScheduledSegment};

const MIXER_START_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// CpalOutputSink
// ---------------------------------------------------------------------------

/// Output sink over the system's default cpal output device.
pub struct CpalOutputSink {
    shared: Arc<MixerShared>,
    mixer: Mutex<Option<MixerThread>>,
}

impl CpalOutputSink {
    /// Open the default output device and start the mixer thread.
    pub fn open() -> Result<Self, PlaybackError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlaybackError::Sink("no output device".into()))?;
        let config = device
            .default_output_config()
            .map_err(|e| PlaybackError::Sink(e.to_string()))?
            .config();

        let shared = Arc::new(MixerShared {
            sample_rate: config.sample_rate.0,
            frames_played: AtomicU64::new(0),
            segments: Mutex::new(Vec::new()),
        });

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), PlaybackError>>();

        let thread_shared = Arc::clone(&shared);
        let channels = config.channels as usize;
        let join = std::thread::Builder::new()
            .name("output-mixer".into())
            .spawn(move || {
                run_mixer(device, config, channels, thread_shared, ready_tx, shutdown_rx)
            })
            .map_err(|e| PlaybackError::Sink(e.to_string()))?;

        match ready_rx.recv_timeout(MIXER_START_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = join.join();
                return Err(err);
            }
            Err(_) => {
                return Err(PlaybackError::Sink(
                    "output mixer thread did not start in time".into(),
                ));
            }
        }

        log::debug!(
            "output mixer running at {} Hz, {} channel(s)",
            shared.sample_rate,
            channels
        );

        Ok(Self {
            shared,
            mixer: Mutex::new(Some(MixerThread {
                shutdown: shutdown_tx,
                join: Some(join),
            })),
        })
    }
}

impl OutputSink for CpalOutputSink {
    fn clock_secs(&self) -> f64 {
        self.shared.clock_secs()
    }

    fn schedule(
        &self,
        audio: DecodedAudio,
        start_secs: f64,
        rate: f64,
        on_ended: Box<dyn FnOnce() + Send>,
    ) -> Result<Box<dyn ScheduledSegment>, PlaybackError> {
        self.shared.schedule(audio, start_secs, rate, on_ended)
    }
}

impl Drop for CpalOutputSink {
    fn drop(&mut self) {
        if let Ok(mut mixer) = self.mixer.lock() {
            if let Some(mut thread) = mixer.take() {
                thread.stop();
            }
        }
    }
}

/// Opens a fresh [`CpalOutputSink`] per call.
pub struct CpalOutputFactory;

impl OutputFactory for CpalOutputFactory {
    fn open_output(&self) -> Result<Arc<dyn OutputSink>, PlaybackError> {
        Ok(Arc::new(CpalOutputSink::open()?))
    }
}

// ---------------------------------------------------------------------------
// Mixer state
// ---------------------------------------------------------------------------

struct MixerThread {
    shutdown: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl MixerThread {
    fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// One segment sitting on the output timeline.
struct ActiveSegment {
    start_frame: u64,
    /// Mono samples at the device rate, playback rate already folded in.
    samples: Vec<f32>,
    stopped: Arc<AtomicBool>,
    on_ended: Option<Box<dyn FnOnce() + Send>>,
}

/// State shared between the sink handle and the mixer callback.
struct MixerShared {
    sample_rate: u32,
    frames_played: AtomicU64,
    segments: Mutex<Vec<ActiveSegment>>,
}

impl MixerShared {
    fn clock_secs(&self) -> f64 {
        self.frames_played.load(Ordering::Acquire) as f64 / f64::from(self.sample_rate)
    }

    fn schedule(
        &self,
        audio: DecodedAudio,
        start_secs: f64,
        rate: f64,
        on_ended: Box<dyn FnOnce() + Send>,
    ) -> Result<Box<dyn ScheduledSegment>, PlaybackError> {
        if audio.samples.is_empty() || audio.sample_rate == 0 {
            // Zero-length segments complete synchronously.
            on_ended();
            return Ok(Box::new(CpalScheduledSegment {
                stopped: Arc::new(AtomicBool::new(true)),
            }));
        }

        // Treating the source as `rate` times faster and resampling to the
        // device rate gives playback-rate semantics: rate 2.0 halves the
        // duration (and raises pitch), rate 0.5 doubles it.
        let rate = if rate <= 0.0 { 1.0 } else { rate };
        let samples = resample(
            &audio.samples,
            f64::from(audio.sample_rate) * rate,
            f64::from(self.sample_rate),
        );
        let start_frame = (start_secs.max(0.0) * f64::from(self.sample_rate)).round() as u64;

        let stopped = Arc::new(AtomicBool::new(false));
        self.segments.lock().unwrap().push(ActiveSegment {
            start_frame,
            samples,
            stopped: Arc::clone(&stopped),
            on_ended: Some(on_ended),
        });

        Ok(Box::new(CpalScheduledSegment { stopped }))
    }

    /// Fill one interleaved output buffer and advance the clock.
    ///
    /// Ended callbacks run after the segment lock is released, so a callback
    /// is free to call back into the scheduler.
    fn render(&self, data: &mut [f32], channels: usize) {
        data.fill(0.0);
        let frames = (data.len() / channels.max(1)) as u64;
        let base = self.frames_played.load(Ordering::Acquire);

        let mut ended: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        {
            let mut segments = self.segments.lock().unwrap();
            for seg in segments.iter_mut() {
                if seg.stopped.load(Ordering::Acquire) {
                    continue;
                }
                for i in 0..frames {
                    let frame = base + i;
                    if frame < seg.start_frame {
                        continue;
                    }
                    let idx = (frame - seg.start_frame) as usize;
                    if idx >= seg.samples.len() {
                        break;
                    }
                    let sample = seg.samples[idx];
                    let offset = i as usize * channels;
                    for ch in 0..channels {
                        data[offset + ch] += sample;
                    }
                }
            }
            segments.retain_mut(|seg| {
                let stopped = seg.stopped.load(Ordering::Acquire);
                let finished =
                    base + frames >= seg.start_frame + seg.samples.len() as u64;
                if finished && !stopped {
                    // Natural completion only; stopped segments never signal.
                    if let Some(callback) = seg.on_ended.take() {
                        ended.push(callback);
                    }
                }
                !(finished || stopped)
            });
        }

        self.frames_played.fetch_add(frames, Ordering::AcqRel);
        for callback in ended {
            callback();
        }
    }
}

struct CpalScheduledSegment {
    stopped: Arc<AtomicBool>,
}

impl ScheduledSegment for CpalScheduledSegment {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Mixer thread
// ---------------------------------------------------------------------------

fn run_mixer(
    device: cpal::Device,
    config: cpal::StreamConfig,
    channels: usize,
    shared: Arc<MixerShared>,
    ready_tx: mpsc::Sender<Result<(), PlaybackError>>,
    shutdown_rx: mpsc::Receiver<()>,
) {
    let built = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            shared.render(data, channels);
        },
        |err| log::warn!("output stream error: {err}"),
        None,
    );

    let stream = match built {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready_tx.send(Err(PlaybackError::Sink(err.to_string())));
            return;
        }
    };
    if let Err(err) = stream.play() {
        let _ = ready_tx.send(Err(PlaybackError::Sink(err.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(()));
    let _ = shutdown_rx.recv();
    drop(stream);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn shared(rate: u32) -> MixerShared {
        MixerShared {
            sample_rate: rate,
            frames_played: AtomicU64::new(0),
            segments: Mutex::new(Vec::new()),
        }
    }

    fn audio(samples: Vec<f32>, rate: u32) -> DecodedAudio {
        DecodedAudio {
            samples,
            sample_rate: rate,
        }
    }

    fn noop() -> Box<dyn FnOnce() + Send> {
        Box::new(|| {})
    }

    // ---- clock -------------------------------------------------------------

    #[test]
    fn render_advances_the_clock_by_frames() {
        let mixer = shared(16_000);
        let mut buffer = vec![0.0f32; 320 * 2]; // 320 frames, stereo

        mixer.render(&mut buffer, 2);
        assert!((mixer.clock_secs() - 0.02).abs() < 1e-9);
        mixer.render(&mut buffer, 2);
        assert!((mixer.clock_secs() - 0.04).abs() < 1e-9);
    }

    // ---- mixing ------------------------------------------------------------

    #[test]
    fn segment_starts_at_its_scheduled_frame() {
        let mixer = shared(16_000);
        // 4 samples of 0.5 starting at frame 2.
        mixer
            .schedule(audio(vec![0.5; 4], 16_000), 2.0 / 16_000.0, 1.0, noop())
            .unwrap();

        let mut buffer = vec![0.0f32; 8]; // 8 mono frames
        mixer.render(&mut buffer, 1);
        assert_eq!(&buffer[..], &[0.0, 0.0, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn overlapping_segments_sum() {
        let mixer = shared(16_000);
        mixer
            .schedule(audio(vec![0.25; 4], 16_000), 0.0, 1.0, noop())
            .unwrap();
        mixer
            .schedule(audio(vec![0.25; 4], 16_000), 0.0, 1.0, noop())
            .unwrap();

        let mut buffer = vec![0.0f32; 4];
        mixer.render(&mut buffer, 1);
        assert!(buffer.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn mono_source_duplicates_to_all_channels() {
        let mixer = shared(16_000);
        mixer
            .schedule(audio(vec![0.5; 2], 16_000), 0.0, 1.0, noop())
            .unwrap();

        let mut buffer = vec![0.0f32; 4]; // 2 stereo frames
        mixer.render(&mut buffer, 2);
        assert_eq!(&buffer[..], &[0.5, 0.5, 0.5, 0.5]);
    }

    // ---- completion --------------------------------------------------------

    #[test]
    fn natural_completion_fires_on_ended_once() {
        let mixer = shared(16_000);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        mixer
            .schedule(
                audio(vec![0.1; 4], 16_000),
                0.0,
                1.0,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let mut buffer = vec![0.0f32; 8];
        mixer.render(&mut buffer, 1);
        mixer.render(&mut buffer, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_segment_goes_silent_and_never_signals() {
        let mixer = shared(16_000);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let mut handle = mixer
            .schedule(
                audio(vec![0.5; 100], 16_000),
                0.0,
                1.0,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        handle.stop();
        let mut buffer = vec![0.0f32; 200];
        mixer.render(&mut buffer, 1);

        assert!(buffer.iter().all(|&s| s == 0.0));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(mixer.segments.lock().unwrap().len(), 0);
    }

    #[test]
    fn empty_audio_completes_synchronously() {
        let mixer = shared(16_000);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        mixer
            .schedule(
                audio(vec![], 16_000),
                0.0,
                1.0,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    // ---- rate folding ------------------------------------------------------

    #[test]
    fn playback_rate_scales_segment_length() {
        let mixer = shared(48_000);
        // 1 s of 24 kHz audio at rate 2.0 → 0.5 s at the device rate.
        mixer
            .schedule(audio(vec![0.1; 24_000], 24_000), 0.0, 2.0, noop())
            .unwrap();

        let len = mixer.segments.lock().unwrap()[0].samples.len();
        assert!((len as i64 - 24_000).abs() <= 1);
    }
}
