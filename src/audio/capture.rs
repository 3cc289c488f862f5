//! Capture session lifecycle.
//!
//! [`CaptureSession`] owns exactly one live device stream acquired through
//! the constraint ladder.  The controller holds at most one session at a
//! time; everything that can invalidate a stream happens asynchronously, so
//! the session re-checks liveness against the real device state around every
//! suspension point and re-runs the ladder when the stream has died.

use std::sync::Arc;

use crate::audio::constraints::{negotiate, AcquireError, StageName};
use crate::device::{CaptureBackend, DeviceStream};

// ---------------------------------------------------------------------------
// CaptureSession
// ---------------------------------------------------------------------------

/// One acquired microphone stream plus the stage it was granted with.
pub struct CaptureSession {
    backend: Arc<dyn CaptureBackend>,
    stream: Option<Box<dyn DeviceStream>>,
    applied: StageName,
    fallback_applied: bool,
}

impl CaptureSession {
    /// Run the ladder against `backend` and wrap the granted stream.
    ///
    /// Suspension point — callers must treat the session as unknown-age
    /// after awaiting this.
    pub async fn acquire(backend: Arc<dyn CaptureBackend>) -> Result<Self, AcquireError> {
        let granted = negotiate(backend.as_ref()).await?;
        log::info!(
            "capture session acquired ({} stage, fallback={})",
            granted.stage.label(),
            granted.fallback_applied
        );
        Ok(Self {
            backend,
            stream: Some(granted.stream),
            applied: granted.stage,
            fallback_applied: granted.fallback_applied,
        })
    }

    /// Which ladder stage the current stream was granted with.
    pub fn applied_stage(&self) -> StageName {
        self.applied
    }

    /// Whether any ladder stage failed before the applied one.
    pub fn fallback_applied(&self) -> bool {
        self.fallback_applied
    }

    /// Whether the device track is still delivering audio.
    ///
    /// Always queries the stream itself — a track can die at any moment
    /// without the controller being told.
    pub fn is_live(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| s.is_live())
    }

    /// Mutable access to the stream for node wiring.  `None` after
    /// [`release`](Self::release).
    pub fn stream_mut(&mut self) -> Option<&mut Box<dyn DeviceStream>> {
        self.stream.as_mut()
    }

    /// Re-run the ladder and swap in a fresh stream.
    ///
    /// The old stream is stopped only after the new one is confirmed live,
    /// so a failed re-acquisition never leaves the session worse off than a
    /// dead stream it already had.
    pub async fn reacquire(&mut self) -> Result<(), AcquireError> {
        log::warn!("capture stream lost liveness, re-acquiring");
        let granted = negotiate(self.backend.as_ref()).await?;
        if !granted.stream.is_live() {
            return Err(AcquireError::Other(
                "re-acquired stream was dead on arrival".into(),
            ));
        }

        let stage = granted.stage;
        if let Some(mut old) = self.stream.replace(granted.stream) {
            old.stop();
        }
        self.applied = stage;
        self.fallback_applied = granted.fallback_applied;
        log::info!("capture session re-acquired ({} stage)", stage.label());
        Ok(())
    }

    /// Re-acquire only when the stream has died.  Called before and after
    /// every suspension point in path setup.
    pub async fn ensure_live(&mut self) -> Result<(), AcquireError> {
        if self.is_live() {
            return Ok(());
        }
        self.reacquire().await
    }

    /// Stop the track and drop all handles.  Idempotent — safe to call on an
    /// already-released session.
    pub fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            log::debug!("capture session released");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
