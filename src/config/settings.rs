//! Pipeline settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// AudioSettings
// ---------------------------------------------------------------------------

/// Settings for the capture side of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Capture rate the pipeline normalises to, in Hz.  The outbound chunk
    /// format is defined at 16 000 and downstream consumers depend on it.
    pub sample_rate: u32,
    /// Buffer size of the periodic-callback fallback path, in mono samples.
    pub periodic_buffer_size: usize,
    /// RMS threshold (i16 units) above which a chunk counts as speech.
    pub vad_rms_threshold: f32,
    /// Preferred input device name — `None` means the system default.
    pub preferred_device: Option<String>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            periodic_buffer_size: 4096,
            vad_rms_threshold: 400.0,
            preferred_device: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PlaybackSettings
// ---------------------------------------------------------------------------

/// Settings for the playback side of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackSettings {
    /// Playback rate applied when the caller does not pass one explicitly.
    pub default_rate: f64,
    /// Sample rate of raw PCM16 payloads from the remote service, in Hz.
    pub decode_sample_rate: u32,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            default_rate: 1.0,
            decode_sample_rate: 24_000,
        }
    }
}

// ---------------------------------------------------------------------------
// BridgeConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level pipeline configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_bridge::config::BridgeConfig;
///
/// // Load (returns Default when file is missing)
/// let config = BridgeConfig::load().unwrap();
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Capture / VAD settings.
    pub audio: AudioSettings,
    /// Playback / decode settings.
    pub playback: PlaybackSettings,
}

impl BridgeConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(BridgeConfig::default())` when the file does not exist
    /// yet (first-run scenario) so callers never need to special-case a
    /// missing file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
