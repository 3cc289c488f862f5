//! Capture-constraint fallback ladder.
//!
//! Microphone drivers disagree wildly about what they will accept, so the
//! pipeline never issues a single take-it-or-leave-it request.  Instead it
//! walks an ordered ladder of four [`ConstraintStage`]s, from the most
//! specific request (16 kHz mono, 16-bit, all DSP flags on) down to a bare
//! "any audio input", and keeps the first stream the backend grants.
//!
//! ```text
//! Enhanced → Reduced → Minimal → Default
//! ```
//!
//! Classification matters more than retrying: a permission denial or a
//! missing device will fail *every* stage identically, so those abort the
//! ladder immediately with a user-actionable error instead of burning three
//! more attempts.

use thiserror::Error;

use crate::device::{CaptureBackend, DeviceStream};

// ---------------------------------------------------------------------------
// AcquireError
// ---------------------------------------------------------------------------

/// Why a capture stream could not be acquired.
///
/// The first three variants are *fatal*: they abort the whole ladder because
/// no relaxation of the request can fix them.  The rest are absorbed by the
/// ladder, which records them and moves on to the next stage.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AcquireError {
    /// The OS (or the user) refused microphone access.
    #[error("microphone permission denied")]
    PermissionDenied,

    /// No audio input device is present on the host.
    #[error("no microphone found")]
    DeviceNotFound,

    /// A device exists but another process holds it exclusively.
    #[error("microphone is in use by another application")]
    DeviceBusy,

    /// The device rejected this stage's specific configuration.
    #[error("capture constraints not satisfiable: {0}")]
    ConstraintNotSatisfiable(String),

    /// Anything else the backend reported.
    #[error("capture acquisition failed: {0}")]
    Other(String),
}

impl AcquireError {
    /// Fatal errors abort the ladder; non-fatal ones let it relax and retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AcquireError::PermissionDenied
                | AcquireError::DeviceNotFound
                | AcquireError::DeviceBusy
        )
    }

    /// Actionable message for the end user.  Only fatal acquisition failures
    /// ever surface to the UI; internal fallbacks stay invisible.
    pub fn user_message(&self) -> &'static str {
        match self {
            AcquireError::PermissionDenied => {
                "Microphone access was denied. Grant microphone permission and try again."
            }
            AcquireError::DeviceNotFound => {
                "No microphone was found. Connect an audio input device and try again."
            }
            AcquireError::DeviceBusy => {
                "The microphone is busy. Close other applications using it and try again."
            }
            _ => "Could not start the microphone with any supported configuration.",
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureRequest / ConstraintStage
// ---------------------------------------------------------------------------

/// One capture configuration request.  `None` means "no preference".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub channels: Option<u16>,
    pub sample_rate: Option<u32>,
    pub sample_bits: Option<u16>,
    pub echo_cancellation: Option<bool>,
    pub noise_suppression: Option<bool>,
    pub auto_gain: Option<bool>,
}

impl CaptureRequest {
    /// The bottom of the ladder: accept whatever the device offers.
    pub const fn any() -> Self {
        Self {
            channels: None,
            sample_rate: None,
            sample_bits: None,
            echo_cancellation: None,
            noise_suppression: None,
            auto_gain: None,
        }
    }

    /// Count of constrained fields, used to assert ladder monotonicity.
    pub fn specificity(&self) -> usize {
        [
            self.channels.is_some(),
            self.sample_rate.is_some(),
            self.sample_bits.is_some(),
            self.echo_cancellation.is_some(),
            self.noise_suppression.is_some(),
            self.auto_gain.is_some(),
        ]
        .iter()
        .filter(|&&c| c)
        .count()
    }
}

/// Which rung of the ladder a stream was (or was being) acquired with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageName {
    Enhanced,
    Reduced,
    Minimal,
    Default,
}

impl StageName {
    pub fn label(&self) -> &'static str {
        match self {
            StageName::Enhanced => "enhanced",
            StageName::Reduced => "reduced",
            StageName::Minimal => "minimal",
            StageName::Default => "default",
        }
    }
}

/// A named rung of the ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintStage {
    pub name: StageName,
    pub request: CaptureRequest,
}

/// The four stages, in the fixed order they are tried.
///
/// Each stage strictly relaxes the previous one; nothing is re-tightened
/// further down.  The table is static by design — negotiation must be
/// reproducible and auditable, never assembled at runtime.
pub const STAGES: [ConstraintStage; 4] = [
    ConstraintStage {
        name: StageName::Enhanced,
        request: CaptureRequest {
            channels: Some(1),
            sample_rate: Some(16_000),
            sample_bits: Some(16),
            echo_cancellation: Some(true),
            noise_suppression: Some(true),
            auto_gain: Some(true),
        },
    },
    ConstraintStage {
        name: StageName::Reduced,
        request: CaptureRequest {
            channels: Some(1),
            sample_rate: Some(16_000),
            sample_bits: None,
            echo_cancellation: Some(true),
            noise_suppression: None,
            auto_gain: None,
        },
    },
    ConstraintStage {
        name: StageName::Minimal,
        request: CaptureRequest {
            channels: Some(1),
            sample_rate: None,
            sample_bits: None,
            echo_cancellation: None,
            noise_suppression: None,
            auto_gain: None,
        },
    },
    ConstraintStage {
        name: StageName::Default,
        request: CaptureRequest::any(),
    },
];

// ---------------------------------------------------------------------------
// negotiate
// ---------------------------------------------------------------------------

/// Outcome of a successful ladder run.
pub struct NegotiatedStream {
    /// The stage that was actually granted.
    pub stage: StageName,
    /// `true` when any stage before the granted one failed.
    pub fallback_applied: bool,
    /// The failures recorded on the way down, for diagnostics.
    pub attempts: Vec<(StageName, AcquireError)>,
    /// The live device stream.
    pub stream: Box<dyn DeviceStream>,
}

impl std::fmt::Debug for NegotiatedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedStream")
            .field("stage", &self.stage)
            .field("fallback_applied", &self.fallback_applied)
            .field("attempts", &self.attempts)
            .field("stream", &"<dyn DeviceStream>")
            .finish()
    }
}

/// Walk the ladder against `backend` until a stage is granted.
///
/// * First success wins — later stages are never tried.
/// * A fatal error ([`AcquireError::is_fatal`]) aborts immediately.
/// * If all four stages fail non-fatally, the *last* recorded error is
///   surfaced.
///
/// No stage is ever retried, and the caller always learns which stage was
/// applied via [`NegotiatedStream::stage`].
pub async fn negotiate(backend: &dyn CaptureBackend) -> Result<NegotiatedStream, AcquireError> {
    let mut attempts: Vec<(StageName, AcquireError)> = Vec::new();

    for stage in &STAGES {
        log::debug!("ladder: trying {} stage", stage.name.label());
        match backend.acquire(&stage.request).await {
            Ok(stream) => {
                let fallback_applied = !attempts.is_empty();
                if fallback_applied {
                    log::info!(
                        "ladder: {} stage granted after {} failed attempt(s)",
                        stage.name.label(),
                        attempts.len()
                    );
                }
                return Ok(NegotiatedStream {
                    stage: stage.name,
                    fallback_applied,
                    attempts,
                    stream,
                });
            }
            Err(err) if err.is_fatal() => {
                log::error!("ladder: fatal at {} stage: {err}", stage.name.label());
                return Err(err);
            }
            Err(err) => {
                log::warn!("ladder: {} stage rejected: {err}", stage.name.label());
                attempts.push((stage.name, err));
            }
        }
    }

    // All four stages exhausted — surface the last recorded error.
    let (_, last) = attempts.pop().unwrap_or((
        StageName::Default,
        AcquireError::Other("no stages attempted".into()),
    ));
    Err(last)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
