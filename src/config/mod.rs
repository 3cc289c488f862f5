//! Configuration module for the voice bridge.
//!
//! Provides `BridgeConfig` (top-level settings), sub-configs for the capture
//! and playback sides, `AppPaths` for cross-platform config directories, and
//! TOML persistence via `BridgeConfig::load` / `BridgeConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{AudioSettings, BridgeConfig, PlaybackSettings};
