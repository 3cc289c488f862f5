//! Processing-path selection and downgrade.
//!
//! Two mutually exclusive strategies move captured audio into the encoder:
//!
//! * **Low-latency path** — an off-thread processing node that forwards
//!   buffers as fast as the driver produces them.  Needs a one-time module
//!   install and a silent monitor sink to keep the engine's scheduler
//!   pumping (the path itself must never be audible).
//! * **Periodic-callback path** — a fixed 4096-sample mono buffer node,
//!   wired directly with no monitor sink.
//!
//! The selector tries the low-latency path when the backend offers it and
//! silently downgrades to the periodic path on *any* setup failure, tearing
//! down every partially constructed low-latency resource first.  Only both
//! paths failing is fatal to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, OnceLock};

use thiserror::Error;

use crate::audio::capture::CaptureSession;
use crate::audio::constraints::AcquireError;
use crate::device::{CaptureBackend, MonitorSink, ProcessingNode};

// ---------------------------------------------------------------------------
// SetupError
// ---------------------------------------------------------------------------

/// Why a processing path could not be wired onto the capture stream.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The one-time processing-module install failed.
    #[error("processing module install failed: {0}")]
    ModuleInstall(String),

    /// The processing node itself could not be started.
    #[error("processing node start failed: {0}")]
    NodeStart(String),

    /// The silent monitor sink could not be opened.
    #[error("monitor sink open failed: {0}")]
    MonitorSink(String),

    /// The stream died during setup and could not be re-acquired.
    #[error("capture session lost during setup: {0}")]
    SessionLost(#[from] AcquireError),

    /// Setup was attempted on a released session.
    #[error("capture session already released")]
    SessionReleased,
}

// ---------------------------------------------------------------------------
// ModuleGuard
// ---------------------------------------------------------------------------

/// Installed-once guard for the low-latency processing module.
///
/// The install cost is paid once per process, not once per session, so the
/// flag outlives any individual [`CaptureSession`].  It is explicit state
/// threaded through path setup — never an ambient singleton — and tests use
/// [`ModuleGuard::fresh`] to get an independent, resettable instance.
#[derive(Clone)]
pub struct ModuleGuard {
    loaded: Arc<AtomicBool>,
}

impl ModuleGuard {
    /// The shared process-wide guard.
    pub fn process_global() -> Self {
        static GLOBAL: OnceLock<Arc<AtomicBool>> = OnceLock::new();
        Self {
            loaded: GLOBAL.get_or_init(|| Arc::new(AtomicBool::new(false))).clone(),
        }
    }

    /// An independent guard, for tests and embedders that manage scope
    /// themselves.
    pub fn fresh() -> Self {
        Self {
            loaded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    /// Forget the installed module.  Test hook.
    pub fn reset(&self) {
        self.loaded.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// ProcessingPath
// ---------------------------------------------------------------------------

/// Which strategy ended up active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    LowLatency,
    Periodic,
}

impl PathKind {
    pub fn label(&self) -> &'static str {
        match self {
            PathKind::LowLatency => "low-latency",
            PathKind::Periodic => "periodic",
        }
    }
}

/// The active processing path for one capture session.
///
/// Deliberately an enum with payload rather than a shared trait object: the
/// two variants have materially different wiring (the monitor sink exists
/// only on the low-latency side) and share no contract beyond "frames come
/// out of the channel".  Exactly one variant is ever active per session.
pub enum ProcessingPath {
    LowLatency {
        node: Box<dyn ProcessingNode>,
        monitor: Box<dyn MonitorSink>,
    },
    Periodic {
        node: Box<dyn ProcessingNode>,
    },
}

impl ProcessingPath {
    pub fn kind(&self) -> PathKind {
        match self {
            ProcessingPath::LowLatency { .. } => PathKind::LowLatency,
            ProcessingPath::Periodic { .. } => PathKind::Periodic,
        }
    }

    /// Detach the node(s) and close the monitor sink, in that order.
    pub fn shutdown(&mut self) {
        match self {
            ProcessingPath::LowLatency { node, monitor } => {
                node.detach();
                monitor.close();
            }
            ProcessingPath::Periodic { node } => node.detach(),
        }
    }
}

/// Selection outcome, including why a downgrade happened (if one did).
pub struct SelectedPath {
    pub path: ProcessingPath,
    /// `Some(reason)` when the low-latency path was attempted and failed.
    pub downgrade_reason: Option<String>,
}

impl std::fmt::Debug for SelectedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedPath")
            .field("path", &self.path.kind())
            .field("downgrade_reason", &self.downgrade_reason)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// select_path
// ---------------------------------------------------------------------------

/// Pick and wire a processing path onto `session`'s stream.
///
/// Decision procedure: prefer the low-latency path when the backend offers
/// it; on any setup failure discard its partial resources, record the
/// reason, and fall back to the periodic path with `periodic_buffer`-sample
/// buffers.  Both failing propagates the periodic path's error.
pub async fn select_path(
    backend: &Arc<dyn CaptureBackend>,
    session: &mut CaptureSession,
    modules: &ModuleGuard,
    periodic_buffer: usize,
    frames: mpsc::Sender<Vec<f32>>,
) -> Result<SelectedPath, SetupError> {
    if backend.supports_low_latency() {
        match setup_low_latency(backend, session, modules, frames.clone()).await {
            Ok(path) => {
                log::info!("low-latency processing path active");
                return Ok(SelectedPath {
                    path,
                    downgrade_reason: None,
                });
            }
            Err(err) => {
                log::warn!("low-latency path setup failed ({err}), downgrading to periodic path");
                let path = setup_periodic(session, periodic_buffer, frames).await?;
                return Ok(SelectedPath {
                    path,
                    downgrade_reason: Some(err.to_string()),
                });
            }
        }
    }

    let path = setup_periodic(session, periodic_buffer, frames).await?;
    Ok(SelectedPath {
        path,
        downgrade_reason: None,
    })
}

/// Wire the low-latency path: liveness → module install (once per process)
/// → liveness again (install is a suspension point and the stream may have
/// died meanwhile) → node → monitor sink.
async fn setup_low_latency(
    backend: &Arc<dyn CaptureBackend>,
    session: &mut CaptureSession,
    modules: &ModuleGuard,
    frames: mpsc::Sender<Vec<f32>>,
) -> Result<ProcessingPath, SetupError> {
    session.ensure_live().await?;

    if !modules.loaded() {
        backend.install_low_latency_module().await?;
        modules.mark_loaded();
        log::debug!("low-latency processing module installed");
    }

    // The install awaited; the stream may have died while we were gone.
    session.ensure_live().await?;

    let stream = session.stream_mut().ok_or(SetupError::SessionReleased)?;
    let mut node = stream.start_low_latency_node(frames)?;

    match backend.open_monitor_sink() {
        Ok(monitor) => Ok(ProcessingPath::LowLatency { node, monitor }),
        Err(err) => {
            // Partial construction — the node must not survive the failure.
            node.detach();
            Err(err)
        }
    }
}

/// Wire the periodic-callback path: liveness → fixed-size node, connected
/// directly (its callback cadence needs no monitor sink).
async fn setup_periodic(
    session: &mut CaptureSession,
    periodic_buffer: usize,
    frames: mpsc::Sender<Vec<f32>>,
) -> Result<ProcessingPath, SetupError> {
    session.ensure_live().await?;

    let stream = session.stream_mut().ok_or(SetupError::SessionReleased)?;
    let node = stream.start_periodic_node(periodic_buffer, frames)?;
    log::info!("periodic-callback processing path active ({periodic_buffer}-sample buffers)");
    Ok(ProcessingPath::Periodic { node })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
