//! Shared animation signal read by the renderer
//!
//! Holds the current viseme and speaking activity. Writers always replace the
//! value, so whoever wrote last wins; the renderer samples it every frame or
//! waits for changes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::viseme::Viseme;

/// Whether the avatar is currently voicing an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    #[default]
    Idle,
    Speaking,
}

/// Last-writer-wins viseme and activity state
#[derive(Debug, Clone)]
pub struct AvatarSignal {
    viseme: Arc<watch::Sender<Viseme>>,
    activity: Arc<watch::Sender<Activity>>,
}

impl Default for AvatarSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AvatarSignal {
    /// Create a signal at rest (silence, idle)
    #[must_use]
    pub fn new() -> Self {
        let (viseme, _) = watch::channel(Viseme::Sil);
        let (activity, _) = watch::channel(Activity::Idle);
        Self {
            viseme: Arc::new(viseme),
            activity: Arc::new(activity),
        }
    }

    /// Current mouth shape
    #[must_use]
    pub fn viseme(&self) -> Viseme {
        *self.viseme.borrow()
    }

    /// Current activity
    #[must_use]
    pub fn activity(&self) -> Activity {
        *self.activity.borrow()
    }

    pub fn set_viseme(&self, viseme: Viseme) {
        let previous = self.viseme.send_replace(viseme);
        if previous != viseme {
            tracing::trace!(%viseme, "viseme changed");
        }
    }

    pub fn set_activity(&self, activity: Activity) {
        let previous = self.activity.send_replace(activity);
        if previous != activity {
            tracing::debug!(?activity, "avatar activity changed");
        }
    }

    /// Return to the resting pose
    pub fn reset(&self) {
        self.set_viseme(Viseme::Sil);
        self.set_activity(Activity::Idle);
    }

    /// Watch viseme changes
    #[must_use]
    pub fn subscribe_viseme(&self) -> watch::Receiver<Viseme> {
        self.viseme.subscribe()
    }

    /// Watch activity changes
    #[must_use]
    pub fn subscribe_activity(&self) -> watch::Receiver<Activity> {
        self.activity.subscribe()
    }
}
