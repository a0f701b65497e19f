//! Configuration management
//!
//! Values come from defaults, then `~/.config/lotus/config.toml`, then
//! `LOTUS_*` environment variables.

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::conversation::DEFAULT_RESUME_DELAY;
use crate::prefs::{FilePreferenceStore, VoicePreferences};
use crate::speech::SpeechTiming;
use crate::voice::{VadConfig, WakeConfig};
use crate::{Error, Result};

use self::file::LotusConfigFile;

/// Default completion endpoint
pub const DEFAULT_COMPLETION_URL: &str = "https://api.openai.com/v1";

/// Default completion model
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Avatar configuration
#[derive(Debug)]
pub struct Config {
    /// Voice preferences used until the user saves their own
    pub voice: VoicePreferences,

    /// Wake word gate
    pub wake: WakeConfig,

    /// Voice activity detection
    pub vad: VadConfig,

    /// Speech pacing
    pub timing: SpeechTiming,

    /// Wait before listening again after the avatar stops speaking
    pub resume_delay: Duration,

    /// Chat completion endpoint
    pub completion: CompletionConfig,

    /// Path to data directory (voice preferences)
    pub data_dir: PathBuf,
}

/// Chat completion endpoint configuration
#[derive(Debug)]
pub struct CompletionConfig {
    /// OpenAI-compatible base URL
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Bearer token (from `LOTUS_API_KEY` or the config file)
    pub api_key: Option<SecretString>,

    /// Optional system prompt
    pub system_prompt: Option<String>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_COMPLETION_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            system_prompt: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            voice: VoicePreferences::default(),
            wake: WakeConfig::default(),
            vad: VadConfig::default(),
            timing: SpeechTiming::default(),
            resume_delay: DEFAULT_RESUME_DELAY,
            completion: CompletionConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

/// Data directory (`~/.local/share/lotus` on Linux)
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("lotus"))
}

impl Config {
    /// Load configuration from the config file and environment
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a value is malformed or out of range
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// Environment values take precedence over the file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a value is malformed or out of range
    pub fn from_sources(fc: LotusConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let voice = VoicePreferences {
            voice: env("LOTUS_VOICE").or(fc.voice.voice),
            rate: parse_env(&env, "LOTUS_SPEECH_RATE")?
                .or(fc.voice.rate)
                .unwrap_or(defaults.voice.rate),
            volume: parse_env(&env, "LOTUS_VOLUME")?
                .or(fc.voice.volume)
                .unwrap_or(defaults.voice.volume),
            pitch: fc.voice.pitch.unwrap_or(defaults.voice.pitch),
            language: env("LOTUS_LANGUAGE")
                .or(fc.voice.language)
                .unwrap_or(defaults.voice.language),
        };
        voice.validate()?;

        let wake = WakeConfig {
            activation_phrase: env("LOTUS_ACTIVATION_PHRASE")
                .or(fc.wake.activation_phrase)
                .unwrap_or(defaults.wake.activation_phrase),
            deactivation_phrase: env("LOTUS_DEACTIVATION_PHRASE")
                .or(fc.wake.deactivation_phrase)
                .unwrap_or(defaults.wake.deactivation_phrase),
            activation_ack: fc.wake.activation_ack.unwrap_or(defaults.wake.activation_ack),
            deactivation_ack: fc
                .wake
                .deactivation_ack
                .unwrap_or(defaults.wake.deactivation_ack),
            inactivity_prompt: fc
                .wake
                .inactivity_prompt
                .unwrap_or(defaults.wake.inactivity_prompt),
            inactivity_timeout: parse_env(&env, "LOTUS_INACTIVITY_TIMEOUT_MS")?
                .or(fc.wake.inactivity_timeout_ms)
                .map_or(defaults.wake.inactivity_timeout, Duration::from_millis),
        };
        if wake.activation_phrase.trim().is_empty() || wake.deactivation_phrase.trim().is_empty() {
            return Err(Error::Config("wake phrases must not be empty".to_string()));
        }
        if wake.activation_phrase.trim().eq_ignore_ascii_case(wake.deactivation_phrase.trim()) {
            return Err(Error::Config(
                "activation and deactivation phrases must differ".to_string(),
            ));
        }
        positive("inactivity timeout", wake.inactivity_timeout)?;

        let vad = VadConfig {
            threshold: parse_env(&env, "LOTUS_VAD_THRESHOLD")?
                .or(fc.vad.threshold)
                .unwrap_or(defaults.vad.threshold),
            silence_timeout: parse_env(&env, "LOTUS_SILENCE_TIMEOUT_MS")?
                .or(fc.vad.silence_timeout_ms)
                .map_or(defaults.vad.silence_timeout, Duration::from_millis),
            frame_interval: fc
                .vad
                .frame_interval_ms
                .map_or(defaults.vad.frame_interval, Duration::from_millis),
        };
        if !(0.0..1.0).contains(&vad.threshold) {
            return Err(Error::Config(format!(
                "VAD threshold {} out of range 0-1",
                vad.threshold
            )));
        }
        positive("silence timeout", vad.silence_timeout)?;
        positive("VAD frame interval", vad.frame_interval)?;

        let timing = SpeechTiming {
            settle_delay: fc
                .timing
                .settle_delay_ms
                .map_or(defaults.timing.settle_delay, Duration::from_millis),
            frame_interval: fc
                .timing
                .frame_interval_ms
                .map_or(defaults.timing.frame_interval, Duration::from_millis),
            inter_chunk_pause: fc
                .timing
                .inter_chunk_pause_ms
                .map_or(defaults.timing.inter_chunk_pause, Duration::from_millis),
        };
        positive("viseme frame interval", timing.frame_interval)?;

        let resume_delay = fc
            .timing
            .resume_delay_ms
            .map_or(defaults.resume_delay, Duration::from_millis);

        let completion = CompletionConfig {
            base_url: env("LOTUS_COMPLETION_URL")
                .or(fc.completion.base_url)
                .unwrap_or(defaults.completion.base_url),
            model: env("LOTUS_MODEL")
                .or(fc.completion.model)
                .unwrap_or(defaults.completion.model),
            api_key: env("LOTUS_API_KEY")
                .or(fc.completion.api_key)
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
            system_prompt: fc.completion.system_prompt,
        };

        let data_dir = env("LOTUS_DATA_DIR")
            .or(fc.storage.data_dir)
            .map_or(defaults.data_dir, PathBuf::from);

        Ok(Self {
            voice,
            wake,
            vad,
            timing,
            resume_delay,
            completion,
            data_dir,
        })
    }

    /// Preference store under the data directory
    #[must_use]
    pub fn preference_store(&self) -> FilePreferenceStore {
        FilePreferenceStore::in_dir(&self.data_dir)
    }
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {raw:?}")))
        })
        .transpose()
}

fn positive(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(Error::Config(format!("{name} must be greater than zero")));
    }
    Ok(())
}
