//! Persisted voice preferences
//!
//! A single record holding the user's preferred voice, speech rate, volume and
//! language. Stored as JSON under the data directory.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default speech rate (slightly slower than normal for clearer lip-sync)
pub const DEFAULT_RATE: f32 = 0.85;

/// Default output volume
pub const DEFAULT_VOLUME: f32 = 0.8;

/// Default language tag
pub const DEFAULT_LANGUAGE: &str = "en-US";

/// User voice settings applied to every utterance unless overridden
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicePreferences {
    /// Preferred voice id or name fragment
    pub voice: Option<String>,
    /// Speech rate multiplier
    pub rate: f32,
    /// Output volume (0.0 - 1.0)
    pub volume: f32,
    /// Pitch multiplier
    pub pitch: f32,
    /// BCP 47 language tag
    pub language: String,
}

impl Default for VoicePreferences {
    fn default() -> Self {
        Self {
            voice: None,
            rate: DEFAULT_RATE,
            volume: DEFAULT_VOLUME,
            pitch: 1.0,
            language: DEFAULT_LANGUAGE.to_string(),
        }
    }
}

impl VoicePreferences {
    /// Check that every value is usable by a speech engine
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first out-of-range field
    pub fn validate(&self) -> Result<()> {
        if !(0.1..=10.0).contains(&self.rate) {
            return Err(Error::Config(format!("speech rate {} out of range 0.1-10", self.rate)));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(Error::Config(format!("volume {} out of range 0-1", self.volume)));
        }
        if !(0.0..=2.0).contains(&self.pitch) {
            return Err(Error::Config(format!("pitch {} out of range 0-2", self.pitch)));
        }
        if self.language.trim().is_empty() {
            return Err(Error::Config("language must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Storage for the preference record
pub trait PreferenceStore: Send + Sync {
    /// Load the stored record, if any
    ///
    /// # Errors
    ///
    /// Returns error if the record exists but cannot be read
    fn load(&self) -> Result<Option<VoicePreferences>>;

    /// Replace the stored record
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be written
    fn save(&self, prefs: &VoicePreferences) -> Result<()>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct FilePreferenceStore {
    path: PathBuf,
}

impl FilePreferenceStore {
    /// File name used inside a data directory
    pub const FILE_NAME: &'static str = "voice_preferences.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store in `data_dir/voice_preferences.json`
    #[must_use]
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(Self::FILE_NAME))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn load(&self) -> Result<Option<VoicePreferences>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let prefs: VoicePreferences = serde_json::from_str(&content)?;
        tracing::debug!(path = %self.path.display(), "loaded voice preferences");
        Ok(Some(prefs))
    }

    fn save(&self, prefs: &VoicePreferences) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(prefs)?;
        std::fs::write(&self.path, content)?;
        tracing::debug!(path = %self.path.display(), "saved voice preferences");
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    record: Mutex<Option<VoicePreferences>>,
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> Result<Option<VoicePreferences>> {
        Ok(self.record.lock().clone())
    }

    fn save(&self, prefs: &VoicePreferences) -> Result<()> {
        *self.record.lock() = Some(prefs.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let prefs = VoicePreferences::default();
        assert!(prefs.validate().is_ok());
        assert!((prefs.rate - 0.85).abs() < f32::EPSILON);
        assert!((prefs.volume - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let prefs = VoicePreferences {
            volume: 1.5,
            ..VoicePreferences::default()
        };
        assert!(matches!(prefs.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePreferenceStore::in_dir(&dir.path().join("nested"));
        assert!(store.load().unwrap().is_none());

        let prefs = VoicePreferences {
            voice: Some("Samantha".to_string()),
            rate: 1.1,
            ..VoicePreferences::default()
        };
        store.save(&prefs).unwrap();
        assert_eq!(store.load().unwrap(), Some(prefs));
    }

    #[test]
    fn test_partial_record_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePreferenceStore::in_dir(dir.path());
        std::fs::write(store.path(), r#"{"voice":"Karen"}"#).unwrap();

        let prefs = store.load().unwrap().unwrap();
        assert_eq!(prefs.voice.as_deref(), Some("Karen"));
        assert_eq!(prefs.language, "en-US");
    }
}
