//! Caller-owned session state.
//!
//! The backend is stateless across turns. Whoever drives it keeps the
//! session id, the active persona, the transcript and any cached derived
//! views, and submits them with every request.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persona::{PersonaProfile, PersonaSelection};
use crate::reconstruct::{MoodPoint, UserProfile};
use crate::transcript::Transcript;
use crate::turn::TurnRequest;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedViews {
    #[serde(default)]
    pub profile: Option<UserProfile>,
    #[serde(default)]
    pub mood_history: Option<Vec<MoodPoint>>,
    #[serde(default)]
    pub proactive: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

impl DerivedViews {
    pub fn is_empty(&self) -> bool {
        self.profile.is_none()
            && self.mood_history.is_none()
            && self.proactive.is_none()
            && self.topic.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    #[serde(default)]
    pub selection: Option<PersonaSelection>,
    #[serde(default)]
    pub persona: PersonaProfile,
    #[serde(default)]
    pub transcript: Transcript,
    #[serde(default)]
    pub views: DerivedViews,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            session_id: new_session_id(),
            selection: None,
            persona: PersonaProfile::default(),
            transcript: Transcript::new(),
            views: DerivedViews::default(),
        }
    }

    /// Install a freshly generated persona. Always starts a new session; memory
    /// stored under the old id stays in the backend but is no longer reachable
    /// from this state.
    pub fn regenerate(&mut self, selection: PersonaSelection, persona: PersonaProfile) {
        self.selection = Some(selection);
        self.persona = persona;
        self.reset();
    }

    /// New session id with the same persona; transcript and caches are dropped.
    pub fn reset(&mut self) {
        let previous = std::mem::replace(&mut self.session_id, new_session_id());
        tracing::debug!("Rotated session {} -> {}", previous, self.session_id);
        self.transcript.clear();
        self.views = DerivedViews::default();
    }

    pub fn turn_request(&self, utterance: impl Into<String>) -> TurnRequest {
        TurnRequest {
            session_id: self.session_id.clone(),
            utterance: utterance.into(),
            transcript: self.transcript.clone(),
            persona: self.persona.clone(),
            selection: self.selection.clone(),
        }
    }

    /// Adopt the transcript returned by a completed turn. Derived views may now
    /// be stale, so the mood history and profile caches are dropped.
    pub fn apply_turn(&mut self, updated_transcript: Transcript) {
        self.transcript = updated_transcript;
        self.views.profile = None;
        self.views.mood_history = None;
    }
}

fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}
