//! Mood and intent classification over closed vocabularies.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::classification::Classification;
use crate::llm_client::{complete_json, ChatModel, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Joyful,
    Sad,
    Angry,
    Neutral,
    Confused,
    Excited,
    Anxious,
    Surprised,
    Disgusted,
    Fearful,
}

impl Mood {
    pub const ALL: [Mood; 10] = [
        Mood::Joyful,
        Mood::Sad,
        Mood::Angry,
        Mood::Neutral,
        Mood::Confused,
        Mood::Excited,
        Mood::Anxious,
        Mood::Surprised,
        Mood::Disgusted,
        Mood::Fearful,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Joyful => "joyful",
            Mood::Sad => "sad",
            Mood::Angry => "angry",
            Mood::Neutral => "neutral",
            Mood::Confused => "confused",
            Mood::Excited => "excited",
            Mood::Anxious => "anxious",
            Mood::Surprised => "surprised",
            Mood::Disgusted => "disgusted",
            Mood::Fearful => "fearful",
        }
    }

    /// Position on the timeline chart, from disgusted (0) to joyful (5).
    pub fn score(&self) -> f64 {
        match self {
            Mood::Joyful => 5.0,
            Mood::Excited => 4.0,
            Mood::Surprised => 3.5,
            Mood::Neutral => 3.0,
            Mood::Confused => 2.5,
            Mood::Anxious => 1.7,
            Mood::Fearful => 1.5,
            Mood::Sad => 1.0,
            Mood::Angry => 0.5,
            Mood::Disgusted => 0.0,
        }
    }

    /// First known mood token appearing in free text, as a whole word.
    pub fn find_in_text(text: &str) -> Option<Mood> {
        let lowered = text.to_lowercase();
        Mood::ALL
            .iter()
            .filter_map(|mood| {
                let pattern = format!(r"\b{}\b", mood.as_str());
                let re = regex_lite::Regex::new(&pattern).ok()?;
                re.find(&lowered).map(|m| (m.start(), *mood))
            })
            .min_by_key(|(position, _)| *position)
            .map(|(_, mood)| mood)
    }
}

impl FromStr for Mood {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        match Mood::ALL.iter().find(|mood| mood.as_str() == lowered) {
            Some(mood) => Ok(*mood),
            None => bail!("Unknown mood '{}'", raw.trim()),
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Low,
    Medium,
    High,
}

impl Intensity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::Low => "low",
            Intensity::Medium => "medium",
            Intensity::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodClassification {
    pub mood: Mood,
    /// Absent only on the neutral fallback.
    #[serde(default)]
    pub intensity: Option<Intensity>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl MoodClassification {
    pub fn neutral() -> Self {
        Self {
            mood: Mood::Neutral,
            intensity: None,
            reason: None,
        }
    }

    /// Free-text form stored under `user_mood` and re-parsed for the timeline.
    pub fn memory_text(&self) -> String {
        let mut text = format!("User mood: {}", self.mood);
        if let Some(intensity) = self.intensity {
            text.push_str(&format!(", intensity {}", intensity.as_str()));
        }
        if let Some(reason) = self.reason.as_deref().filter(|r| !r.trim().is_empty()) {
            text.push_str(&format!(", because {}", reason.trim()));
        }
        text
    }

    /// Compact label for the system instruction, e.g. `sad (high)`.
    pub fn label(&self) -> String {
        match self.intensity {
            Some(intensity) => format!("{} ({})", self.mood, intensity.as_str()),
            None => self.mood.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Question,
    Statement,
    Request,
    Command,
    Complaint,
    Greeting,
    Farewell,
    Expression,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Question => "question",
            Intent::Statement => "statement",
            Intent::Request => "request",
            Intent::Command => "command",
            Intent::Complaint => "complaint",
            Intent::Greeting => "greeting",
            Intent::Farewell => "farewell",
            Intent::Expression => "expression",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: Intent,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

impl IntentClassification {
    pub fn statement() -> Self {
        Self {
            intent: Intent::Statement,
            target: None,
            details: None,
        }
    }

    pub fn label(&self) -> String {
        match self.target.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(target) => format!("{} about {}", self.intent.as_str(), target.trim()),
            None => self.intent.as_str().to_string(),
        }
    }
}

/// Side-effect-free classification of a single utterance.
#[async_trait]
pub trait AffectExtractor: Send + Sync {
    async fn classify_mood(&self, text: &str) -> Classification<MoodClassification>;

    async fn classify_intent(&self, text: &str) -> Classification<IntentClassification>;
}

const MOOD_INSTRUCTION: &str = r#"Identify the primary emotion in the text.

Respond ONLY with JSON:
{"mood": "joyful"|"sad"|"angry"|"neutral"|"confused"|"excited"|"anxious"|"surprised"|"disgusted"|"fearful", "intensity": "low"|"medium"|"high", "reason": "likely cause or null"}"#;

const INTENT_INSTRUCTION: &str = r#"Identify the primary communicative intention of the message.

Respond ONLY with JSON:
{"intent": "question"|"statement"|"request"|"command"|"complaint"|"greeting"|"farewell"|"expression", "target": "subject of the intent or null", "details": "extra specifics or null"}"#;

pub struct LlmAffectExtractor {
    model: Arc<dyn ChatModel>,
}

impl LlmAffectExtractor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl AffectExtractor for LlmAffectExtractor {
    async fn classify_mood(&self, text: &str) -> Classification<MoodClassification> {
        let messages = vec![Message::system(MOOD_INSTRUCTION), Message::user(text)];
        let result = complete_json::<MoodClassification>(self.model.as_ref(), messages).await;
        Classification::from_result(result, MoodClassification::neutral)
    }

    async fn classify_intent(&self, text: &str) -> Classification<IntentClassification> {
        let messages = vec![Message::system(INTENT_INSTRUCTION), Message::user(text)];
        let result = complete_json::<IntentClassification>(self.model.as_ref(), messages).await;
        Classification::from_result(result, IntentClassification::statement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(&'static str);

    #[async_trait]
    impl ChatModel for Scripted {
        async fn complete(&self, _messages: Vec<Message>) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn score_table_is_fixed() {
        assert_eq!(Mood::Joyful.score(), 5.0);
        assert_eq!(Mood::Disgusted.score(), 0.0);
        assert_eq!(Mood::Anxious.score(), 1.7);
        assert_eq!(Mood::Neutral.score(), 3.0);
        assert!("melancholic".parse::<Mood>().is_err());
    }

    #[test]
    fn text_fallback_finds_earliest_whole_word_mood() {
        assert_eq!(
            Mood::find_in_text("User mood: Sad, intensity high (was angry earlier)"),
            Some(Mood::Sad)
        );
        assert_eq!(Mood::find_in_text("feeling saddened"), None);
        assert_eq!(Mood::find_in_text("nothing here"), None);
    }

    #[test]
    fn memory_text_round_trips_through_fallback() {
        let classification = MoodClassification {
            mood: Mood::Anxious,
            intensity: Some(Intensity::High),
            reason: Some("exam tomorrow".to_string()),
        };
        let text = classification.memory_text();
        assert_eq!(text, "User mood: anxious, intensity high, because exam tomorrow");
        assert_eq!(Mood::find_in_text(&text), Some(Mood::Anxious));
        assert_eq!(classification.label(), "anxious (high)");
    }

    #[tokio::test]
    async fn classifiers_degrade_to_documented_defaults() {
        let extractor = LlmAffectExtractor::new(Arc::new(Scripted(r#"{"mood": "ecstatic"}"#)));
        let mood = extractor.classify_mood("woo").await;
        assert!(mood.is_degraded());
        assert_eq!(mood.into_value(), MoodClassification::neutral());

        let intent = extractor.classify_intent("woo").await;
        assert!(intent.is_degraded());
        assert_eq!(intent.value().intent, Intent::Statement);
    }

    #[tokio::test]
    async fn classifiers_parse_structured_output() {
        let extractor = LlmAffectExtractor::new(Arc::new(Scripted(
            r#"{"mood": "joyful", "intensity": "medium", "intent": "greeting", "target": null}"#,
        )));
        let mood = extractor.classify_mood("Hello!").await;
        assert_eq!(mood.value().mood, Mood::Joyful);
        assert_eq!(mood.value().intensity, Some(Intensity::Medium));

        let intent = extractor.classify_intent("Hello!").await;
        assert_eq!(intent, Classification::Ok(IntentClassification {
            intent: Intent::Greeting,
            target: None,
            details: None,
        }));
    }
}
