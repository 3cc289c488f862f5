//! Session orchestration — ties capture, encoding and playback together.
//!
//! The [`BridgeController`] is the crate's main entry point: it owns the
//! capture session, the processing path, the chunk pump and the playback
//! scheduler, and exposes the start/stop/queue/cleanup lifecycle.

pub mod controller;
pub mod hooks;

pub use controller::{BridgeController, CancelHandle, StartDiagnostics, StartError};
pub use hooks::{ChunkSink, LifecycleHooks, RecordingMetrics};
