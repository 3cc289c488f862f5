//! Session orchestration.
//!
//! [`BridgeController`] ties the capture ladder, the processing-path
//! selector, the encoder pump and the playback scheduler into one lifecycle:
//!
//! ```text
//! initialize_contexts ──▶ output sink + scheduler (idempotent)
//! start_recording     ──▶ ladder → path → frame channel → chunk pump
//! queue_model_audio   ──▶ decode → (revalidate capture) → enqueue
//! stop_recording      ──▶ path shutdown → session release → pump join
//! cleanup             ──▶ all of the above, hooks cleared (idempotent)
//! ```
//!
//! The controller is single-owner (`&mut self` everywhere); what it guards
//! against is *time*, not threads.  Acquisition, module install and decode
//! all await, and the world changes underneath an await: streams die, a
//! [`CancelHandle`] supersedes a start from another task.  A
//! session-generation counter is bumped on every transition and checked
//! after every suspension point, and capture liveness is re-validated
//! against the real device state before any step that assumes a live
//! stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Instant, SystemTime};

use thiserror::Error;

use crate::audio::capture::CaptureSession;
use crate::audio::constraints::{AcquireError, StageName};
use crate::audio::encoder::build_chunk;
use crate::audio::path::{select_path, ModuleGuard, PathKind, ProcessingPath, SetupError};
use crate::config::BridgeConfig;
use crate::device::{CaptureBackend, OutputFactory};
use crate::pipeline::hooks::{ChunkSink, LifecycleHooks, RecordingMetrics};
use crate::playback::decode::AudioDecoder;
use crate::playback::scheduler::PlaybackScheduler;

// ---------------------------------------------------------------------------
// StartError
// ---------------------------------------------------------------------------

/// Why `start_recording` failed.  Partial resources are always torn down
/// before the error is returned.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("a recording session is already active")]
    AlreadyActive,

    /// A newer transition (stop, cleanup, another start) superseded this
    /// start while it was suspended.
    #[error("recording start was superseded before it finished")]
    Cancelled,

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("chunk pump thread failed to start: {0}")]
    Pump(String),
}

// ---------------------------------------------------------------------------
// SessionGeneration
// ---------------------------------------------------------------------------

/// Monotonic transition counter.  A suspended operation records the
/// generation it started under and abandons itself when a later transition
/// has bumped the counter past its token.
#[derive(Clone, Default)]
struct SessionGeneration(Arc<AtomicU64>);

impl SessionGeneration {
    fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, token: u64) -> bool {
        self.0.load(Ordering::SeqCst) == token
    }
}

/// Abandons an in-flight `start_recording` from outside the controller.
///
/// The controller's methods all take `&mut self`, so only a handle obtained
/// up front can supersede a start while it is suspended on acquisition or
/// module install.  Cancelling bumps the session generation; the suspended
/// start notices at its next checkpoint, tears down whatever it wired, and
/// returns [`StartError::Cancelled`].
#[derive(Clone)]
pub struct CancelHandle {
    generation: SessionGeneration,
}

impl CancelHandle {
    /// Supersede whatever transition is currently in flight.  Has no effect
    /// on an already-established recording.
    pub fn cancel(&self) {
        self.generation.bump();
    }
}

// ---------------------------------------------------------------------------
// BridgeController
// ---------------------------------------------------------------------------

/// What `start_recording` ended up negotiating.
#[derive(Debug, Clone)]
pub struct StartDiagnostics {
    pub applied_stage: StageName,
    pub fallback_applied: bool,
    pub path: PathKind,
    /// Why the low-latency path was abandoned, when it was.
    pub downgrade_reason: Option<String>,
}

struct ActiveRecording {
    session: CaptureSession,
    path: ProcessingPath,
    /// Kept so a dead stream can be rewired to the same pump mid-session.
    frame_tx: mpsc::Sender<Vec<f32>>,
    pump: Option<JoinHandle<()>>,
    started_at: SystemTime,
    started: Instant,
}

/// The bidirectional pipeline's single owner.
pub struct BridgeController {
    backend: Arc<dyn CaptureBackend>,
    output: Arc<dyn OutputFactory>,
    decoder: Arc<dyn AudioDecoder>,
    config: BridgeConfig,
    modules: ModuleGuard,
    generation: SessionGeneration,
    hooks: Option<Arc<dyn LifecycleHooks>>,
    recording: Option<ActiveRecording>,
    scheduler: Option<PlaybackScheduler>,
}

impl BridgeController {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        output: Arc<dyn OutputFactory>,
        decoder: Arc<dyn AudioDecoder>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            backend,
            output,
            decoder,
            config,
            modules: ModuleGuard::process_global(),
            generation: SessionGeneration::default(),
            hooks: None,
            recording: None,
            scheduler: None,
        }
    }

    /// Swap in an independent module guard (tests and embedders that manage
    /// the install scope themselves).
    pub fn with_module_guard(mut self, modules: ModuleGuard) -> Self {
        self.modules = modules;
        self
    }

    pub fn set_hooks(&mut self, hooks: Arc<dyn LifecycleHooks>) {
        self.hooks = Some(hooks);
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Handle for cancelling an in-flight `start_recording` from another
    /// task or thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            generation: self.generation.clone(),
        }
    }

    /// Open the output side.  Idempotent: a second call with a live
    /// scheduler is a no-op, so callers may invoke it defensively.
    pub fn initialize_contexts(&mut self) -> Result<(), crate::playback::PlaybackError> {
        if self.scheduler.is_some() {
            return Ok(());
        }
        let sink = self.output.open_output()?;
        self.scheduler = Some(PlaybackScheduler::new(sink));
        log::info!("output pipeline initialized");
        Ok(())
    }

    /// Negotiate capture, wire a processing path, and start pumping chunks
    /// into `sink`.
    pub async fn start_recording(
        &mut self,
        sink: Box<dyn ChunkSink>,
    ) -> Result<StartDiagnostics, StartError> {
        if self.recording.is_some() {
            return Err(StartError::AlreadyActive);
        }
        let token = self.generation.bump();
        let started_at = SystemTime::now();

        let mut session = match CaptureSession::acquire(Arc::clone(&self.backend)).await {
            Ok(session) => session,
            Err(err) => {
                self.report_error(err.user_message());
                return Err(err.into());
            }
        };
        if !self.generation.is_current(token) {
            session.release();
            return Err(StartError::Cancelled);
        }

        let (frame_tx, frame_rx) = mpsc::channel();
        let mut selected = match select_path(
            &self.backend,
            &mut session,
            &self.modules,
            self.config.audio.periodic_buffer_size,
            frame_tx.clone(),
        )
        .await
        {
            Ok(selected) => selected,
            Err(err) => {
                session.release();
                self.report_error(&err.to_string());
                return Err(err.into());
            }
        };
        if !self.generation.is_current(token) {
            selected.path.shutdown();
            session.release();
            return Err(StartError::Cancelled);
        }

        let pump = match spawn_chunk_pump(frame_rx, sink, self.config.audio.vad_rms_threshold) {
            Ok(pump) => pump,
            Err(err) => {
                selected.path.shutdown();
                session.release();
                self.report_error(&err.to_string());
                return Err(StartError::Pump(err.to_string()));
            }
        };

        let diagnostics = StartDiagnostics {
            applied_stage: session.applied_stage(),
            fallback_applied: session.fallback_applied(),
            path: selected.path.kind(),
            downgrade_reason: selected.downgrade_reason,
        };
        log::info!(
            "recording started ({} stage, {} path)",
            diagnostics.applied_stage.label(),
            diagnostics.path.label()
        );

        if let Some(hooks) = &self.hooks {
            hooks.on_start(started_at);
        }
        self.recording = Some(ActiveRecording {
            session,
            path: selected.path,
            frame_tx,
            pump: Some(pump),
            started_at,
            started: Instant::now(),
        });
        Ok(diagnostics)
    }

    /// Tear down the active recording, if any, and report what it was.
    pub fn stop_recording(&mut self) -> Option<RecordingMetrics> {
        self.generation.bump();
        let active = self.recording.take()?;
        let ActiveRecording {
            mut session,
            mut path,
            frame_tx,
            mut pump,
            started_at,
            started,
        } = active;

        path.shutdown();
        session.release();
        // All senders are gone once the nodes are detached; dropping ours
        // lets the pump drain and exit.
        drop(frame_tx);
        if let Some(pump) = pump.take() {
            let _ = pump.join();
        }

        let metrics = RecordingMetrics {
            started_at,
            stopped_at: SystemTime::now(),
            segment_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        log::info!("recording stopped after {:.0} ms", metrics.segment_ms);
        if let Some(hooks) = &self.hooks {
            hooks.on_stop(&metrics);
        }
        Some(metrics)
    }

    /// Decode an inbound payload and place it gaplessly on the output
    /// timeline.  Returns the scheduled duration in milliseconds, or 0.0
    /// when nothing could be scheduled (no output pipeline, decode failure,
    /// sink failure) — inbound audio problems never break the session.
    pub async fn queue_model_audio(&mut self, payload: &[u8], rate: f64) -> f64 {
        if self.scheduler.is_none() {
            log::warn!("queue_model_audio before initialize_contexts; payload dropped");
            return 0.0;
        }

        let decoded = match self.decoder.decode(payload).await {
            Ok(decoded) => decoded,
            Err(err) => {
                log::warn!("payload decode failed: {err}");
                return 0.0;
            }
        };

        // The decode awaited; the capture stream may have died meanwhile.
        self.revalidate_capture().await;

        let Some(scheduler) = self.scheduler.as_mut() else {
            return 0.0;
        };
        match scheduler.enqueue(decoded, rate) {
            Ok(ms) => ms,
            Err(err) => {
                log::warn!("segment scheduling failed: {err}");
                0.0
            }
        }
    }

    /// Stop all live playback segments immediately.
    pub fn stop_playback(&mut self) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.stop_all();
        }
    }

    /// Segments currently on the output timeline.
    pub fn live_playback_segments(&self) -> usize {
        self.scheduler.as_ref().map_or(0, |s| s.live_count())
    }

    /// Release everything: recording, playback, output pipeline, hooks.
    /// Idempotent — a second call finds nothing to do.
    pub fn cleanup(&mut self) {
        self.stop_recording();
        self.stop_playback();
        if self.scheduler.take().is_some() {
            log::info!("output pipeline released");
        }
        self.hooks = None;
    }

    /// Rebuild the processing path when the capture stream died under an
    /// await.  The existing pump keeps its channel; only the device side is
    /// rewired.  An unrecoverable death ends the recording.
    async fn revalidate_capture(&mut self) {
        let Self {
            recording,
            backend,
            modules,
            config,
            hooks,
            ..
        } = self;
        let Some(active) = recording.as_mut() else {
            return;
        };
        if active.session.is_live() {
            return;
        }

        log::warn!("capture stream died during an await, rebuilding processing path");
        active.path.shutdown();
        match select_path(
            backend,
            &mut active.session,
            modules,
            config.audio.periodic_buffer_size,
            active.frame_tx.clone(),
        )
        .await
        {
            Ok(selected) => {
                active.path = selected.path;
                log::info!("processing path rebuilt ({})", active.path.kind().label());
            }
            Err(err) => {
                log::error!("capture could not be restored: {err}");
                if let Some(hooks) = hooks.as_ref() {
                    hooks.on_error(&err.to_string());
                }
                if let Some(mut dead) = recording.take() {
                    dead.session.release();
                    drop(dead.frame_tx);
                    if let Some(pump) = dead.pump.take() {
                        let _ = pump.join();
                    }
                }
            }
        }
    }

    fn report_error(&self, message: &str) {
        log::error!("{message}");
        if let Some(hooks) = &self.hooks {
            hooks.on_error(message);
        }
    }
}

impl Drop for BridgeController {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// ---------------------------------------------------------------------------
// Chunk pump
// ---------------------------------------------------------------------------

/// Drain the frame channel, encode, classify, deliver.  Ends when every
/// sender (nodes plus the controller's rewire handle) is gone.
fn spawn_chunk_pump(
    frames: mpsc::Receiver<Vec<f32>>,
    mut sink: Box<dyn ChunkSink>,
    vad_threshold: f32,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("chunk-pump".into())
        .spawn(move || {
            while let Ok(frame) = frames.recv() {
                if frame.is_empty() {
                    continue;
                }
                let chunk = build_chunk(&frame, vad_threshold);
                if let Err(err) = sink.on_chunk(&chunk) {
                    log::warn!("chunk sink rejected a chunk (dropped): {err}");
                }
            }
            log::debug!("chunk pump drained");
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
