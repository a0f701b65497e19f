//! TOML configuration file loading
//!
//! Supports `~/.config/lotus/config.toml` as a persistent config source.
//! Every field is optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LotusConfigFile {
    #[serde(default)]
    pub voice: VoiceFileConfig,

    #[serde(default)]
    pub wake: WakeFileConfig,

    #[serde(default)]
    pub vad: VadFileConfig,

    #[serde(default)]
    pub timing: TimingFileConfig,

    #[serde(default)]
    pub completion: CompletionFileConfig,

    #[serde(default)]
    pub storage: StorageFileConfig,
}

/// Voice output preferences
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Preferred voice id or name
    pub voice: Option<String>,
    pub rate: Option<f32>,
    pub volume: Option<f32>,
    pub pitch: Option<f32>,
    /// BCP 47 language tag (e.g. "en-US")
    pub language: Option<String>,
}

/// Wake word phrases and inactivity handling
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    pub activation_phrase: Option<String>,
    pub deactivation_phrase: Option<String>,
    pub activation_ack: Option<String>,
    pub deactivation_ack: Option<String>,
    pub inactivity_prompt: Option<String>,
    pub inactivity_timeout_ms: Option<u64>,
}

/// Voice activity detection
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    /// Normalized level (0-1) counted as speech
    pub threshold: Option<f32>,
    pub silence_timeout_ms: Option<u64>,
    pub frame_interval_ms: Option<u64>,
}

/// Speech pacing
#[derive(Debug, Default, Deserialize)]
pub struct TimingFileConfig {
    pub settle_delay_ms: Option<u64>,
    pub frame_interval_ms: Option<u64>,
    pub inter_chunk_pause_ms: Option<u64>,
    /// Wait before listening again after the avatar stops speaking
    pub resume_delay_ms: Option<u64>,
}

/// Chat completion endpoint
#[derive(Debug, Default, Deserialize)]
pub struct CompletionFileConfig {
    /// OpenAI-compatible base URL (e.g. `https://api.openai.com/v1`)
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
}

/// Persistence locations
#[derive(Debug, Default, Deserialize)]
pub struct StorageFileConfig {
    pub data_dir: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `LotusConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> LotusConfigFile {
    config_file_path().map_or_else(LotusConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_config_file_from(path: &Path) -> LotusConfigFile {
    if !path.exists() {
        return LotusConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                LotusConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            LotusConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/lotus/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("lotus").join("config.toml"))
}
