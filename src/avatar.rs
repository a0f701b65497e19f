//! Avatar assembly
//!
//! [`Avatar`] constructs and owns every component of the speech and
//! turn-taking core. Collaborators (speech engine, recognizer, microphone,
//! preference storage) are injected through [`AvatarBuilder`]; anything not
//! supplied falls back to the simulated or in-memory implementation.

use std::sync::Arc;

use crate::Result;
use crate::completion::CompletionClient;
use crate::config::Config;
use crate::conversation::{ConversationOrchestrator, ConversationSession, NotifyingSpeaker, SpeechActivity};
use crate::prefs::{MemoryPreferenceStore, PreferenceStore, VoicePreferences};
use crate::speech::{
    AvatarSignal, SimulatedEngine, SpeakOptions, Speaker, SpeechDriver, SpeechEngine, SpeechQueue, SpeechTicket,
    StreamingSpeaker, VisemeMapper, Voice, clean_for_speech,
};
use crate::voice::{Microphone, ScriptedRecognizer, SilentMicrophone, SpeechRecognizer, WakeWordGate};

/// Builder for [`Avatar`]
pub struct AvatarBuilder {
    config: Config,
    engine: Option<Arc<dyn SpeechEngine>>,
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    microphone: Option<Arc<dyn Microphone>>,
    preferences: Option<Arc<dyn PreferenceStore>>,
    mapper: Option<VisemeMapper>,
}

impl AvatarBuilder {
    /// Speech output engine (default: [`SimulatedEngine`])
    #[must_use]
    pub fn engine(mut self, engine: Arc<dyn SpeechEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Speech recognizer (default: [`ScriptedRecognizer`])
    #[must_use]
    pub fn recognizer(mut self, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    /// Microphone for voice activity detection (default: [`SilentMicrophone`])
    #[must_use]
    pub fn microphone(mut self, microphone: Arc<dyn Microphone>) -> Self {
        self.microphone = Some(microphone);
        self
    }

    /// Where voice preferences persist (default: in memory)
    #[must_use]
    pub fn preferences(mut self, store: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = Some(store);
        self
    }

    /// Viseme mapper, e.g. a seeded one for reproducible timelines
    #[must_use]
    pub fn mapper(mut self, mapper: VisemeMapper) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Wire the components together
    ///
    /// Stored preferences win over the configured ones; a stored record that
    /// cannot be read or is invalid is ignored with a warning.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configured voice preferences are invalid
    pub fn build(self) -> Result<Avatar> {
        let Self {
            config,
            engine,
            recognizer,
            microphone,
            preferences,
            mapper,
        } = self;

        config.voice.validate()?;
        let store = preferences.unwrap_or_else(|| Arc::new(MemoryPreferenceStore::default()));
        let prefs = stored_preferences(store.as_ref()).unwrap_or_else(|| config.voice.clone());

        let engine = engine.unwrap_or_else(|| Arc::new(SimulatedEngine::new()));
        let recognizer = recognizer.unwrap_or_else(|| Arc::new(ScriptedRecognizer::new()));
        let microphone = microphone.unwrap_or_else(|| Arc::new(SilentMicrophone));

        let signal = AvatarSignal::new();
        let mut driver = SpeechDriver::new(engine, signal.clone(), prefs, config.timing);
        if let Some(mapper) = mapper {
            driver = driver.with_mapper(mapper);
        }
        let driver = Arc::new(driver);

        let activity = SpeechActivity::new(Arc::clone(&recognizer), config.resume_delay);
        let speaker: Arc<dyn Speaker> = Arc::new(NotifyingSpeaker::new(
            Arc::clone(&driver) as Arc<dyn Speaker>,
            Arc::clone(&activity),
        ));
        let queue = SpeechQueue::new(Arc::clone(&speaker), config.timing.inter_chunk_pause);
        let streaming = StreamingSpeaker::new(queue);
        let gate = WakeWordGate::new(config.wake.clone(), Arc::clone(&speaker));
        let orchestrator = ConversationOrchestrator::new(
            activity,
            Arc::clone(&speaker),
            streaming.clone(),
            gate,
            microphone,
            config.vad,
        );

        tracing::debug!("avatar assembled");
        Ok(Avatar {
            config,
            signal,
            driver,
            speaker,
            streaming,
            recognizer,
            orchestrator,
            store,
        })
    }
}

fn stored_preferences(store: &dyn PreferenceStore) -> Option<VoicePreferences> {
    match store.load() {
        Ok(Some(prefs)) => match prefs.validate() {
            Ok(()) => Some(prefs),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring invalid stored voice preferences");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load voice preferences");
            None
        }
    }
}

/// The speech, lip-sync and turn-taking core of one avatar
pub struct Avatar {
    config: Config,
    signal: AvatarSignal,
    driver: Arc<SpeechDriver>,
    speaker: Arc<dyn Speaker>,
    streaming: StreamingSpeaker,
    recognizer: Arc<dyn SpeechRecognizer>,
    orchestrator: ConversationOrchestrator,
    store: Arc<dyn PreferenceStore>,
}

impl Avatar {
    #[must_use]
    pub fn builder(config: Config) -> AvatarBuilder {
        AvatarBuilder {
            config,
            engine: None,
            recognizer: None,
            microphone: None,
            preferences: None,
            mapper: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Viseme and activity read by the renderer
    #[must_use]
    pub const fn signal(&self) -> &AvatarSignal {
        &self.signal
    }

    #[must_use]
    pub fn driver(&self) -> &SpeechDriver {
        &self.driver
    }

    /// Speaker that keeps the orchestrator informed
    #[must_use]
    pub fn speaker(&self) -> Arc<dyn Speaker> {
        Arc::clone(&self.speaker)
    }

    #[must_use]
    pub fn queue(&self) -> &SpeechQueue {
        self.streaming.queue()
    }

    #[must_use]
    pub const fn streaming(&self) -> &StreamingSpeaker {
        &self.streaming
    }

    #[must_use]
    pub fn recognizer(&self) -> Arc<dyn SpeechRecognizer> {
        Arc::clone(&self.recognizer)
    }

    #[must_use]
    pub const fn orchestrator(&self) -> &ConversationOrchestrator {
        &self.orchestrator
    }

    #[must_use]
    pub const fn gate(&self) -> &WakeWordGate {
        self.orchestrator.gate()
    }

    /// Queue `text` for speech after anything already queued
    ///
    /// Markdown is stripped first.
    pub fn say(&self, text: &str) -> SpeechTicket {
        self.queue()
            .enqueue(&clean_for_speech(text), SpeakOptions::default())
    }

    /// Stop all speech immediately
    pub fn emergency_stop(&self) {
        self.orchestrator.emergency_stop();
    }

    /// Drive `work` to completion unless `interrupt` resolves first
    ///
    /// An interrupt triggers an emergency stop and yields `None`; `work` is
    /// dropped at that point.
    pub async fn until_interrupted<T>(&self, work: impl Future<Output = T>, interrupt: impl Future) -> Option<T> {
        tokio::select! {
            biased;
            _ = interrupt => {
                tracing::info!("interrupted, silencing speech");
                self.emergency_stop();
                None
            }
            out = work => Some(out),
        }
    }

    /// Voices offered to the user, female-sounding first
    #[must_use]
    pub fn voices(&self) -> Vec<Voice> {
        self.driver.voices()
    }

    #[must_use]
    pub fn voice_preferences(&self) -> VoicePreferences {
        self.driver.preferences()
    }

    /// Validate, persist and apply new voice preferences
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for out-of-range values, or the store's error
    /// if saving fails (the preferences are not applied then)
    pub fn set_voice_preferences(&self, prefs: VoicePreferences) -> Result<()> {
        prefs.validate()?;
        self.store.save(&prefs)?;
        self.driver.set_preferences(prefs);
        Ok(())
    }

    /// Start a conversation session answering through this avatar
    #[must_use]
    pub fn session(&self, client: Arc<dyn CompletionClient>) -> ConversationSession {
        let session = ConversationSession::new(client, self.streaming.clone());
        match &self.config.completion.system_prompt {
            Some(prompt) => session.with_system_prompt(prompt.clone()),
            None => session,
        }
    }

    /// Leave conversation mode and silence everything
    pub async fn shutdown(&self) {
        self.orchestrator.stop_conversation_mode().await;
        self.gate().dispose();
        tracing::debug!("avatar shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn avatar() -> Avatar {
        let engine = SimulatedEngine::with_timing(
            std::time::Duration::from_millis(100),
            std::time::Duration::from_millis(5),
        );
        Avatar::builder(Config::default())
            .engine(Arc::new(engine))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_say_speaks_cleaned_text() {
        let engine = SimulatedEngine::with_timing(
            std::time::Duration::from_millis(100),
            std::time::Duration::from_millis(5),
        );
        let avatar = Avatar::builder(Config::default())
            .engine(Arc::new(engine.clone()))
            .build()
            .unwrap();

        avatar.say("**Hello** there!").await.unwrap();
        assert_eq!(engine.spoken(), vec!["Hello there!"]);
    }

    #[tokio::test]
    async fn test_stored_preferences_win() {
        let store = Arc::new(MemoryPreferenceStore::default());
        let saved = VoicePreferences {
            rate: 1.3,
            ..VoicePreferences::default()
        };
        store.save(&saved).unwrap();

        let avatar = Avatar::builder(Config::default())
            .preferences(store)
            .build()
            .unwrap();
        assert_eq!(avatar.voice_preferences(), saved);
    }

    #[tokio::test]
    async fn test_invalid_preferences_rejected() {
        let avatar = avatar();
        let result = avatar.set_voice_preferences(VoicePreferences {
            volume: 3.0,
            ..VoicePreferences::default()
        });
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(avatar.voice_preferences(), VoicePreferences::default());
    }
}
