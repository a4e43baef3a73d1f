//! Persona selection vocabularies, profile generation and system-instruction
//! assembly.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::affect::{IntentClassification, MoodClassification};
use crate::classification::Classification;
use crate::llm_client::{complete_json, ChatModel, Message};
use crate::memory::MemoryRecord;

pub const NO_RELEVANT_MEMORIES: &str = "No relevant memories found.";

pub const CHARACTER_TRAITS: [&str; 27] = [
    "friendly", "cheerful", "serious", "empathetic", "playful",
    "calm", "energetic", "assertive", "creative", "logical",
    "wild", "jealous", "unpredictable", "controlling", "ruthless",
    "cold", "unreadable", "melancholic", "flirty", "suggestive",
    "enthusiastic", "vulnerable", "argumentative", "dominant", "obsessive",
    "tough", "resourceful",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Formality {
    Informal,
    Friendly,
    Formal,
    Playful,
    Direct,
    Authoritative,
}

impl Formality {
    pub const ALL: [Formality; 6] = [
        Formality::Informal,
        Formality::Friendly,
        Formality::Formal,
        Formality::Playful,
        Formality::Direct,
        Formality::Authoritative,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Formality::Informal => "Informal",
            Formality::Friendly => "Friendly",
            Formality::Formal => "Formal",
            Formality::Playful => "Playful",
            Formality::Direct => "Direct",
            Formality::Authoritative => "Authoritative",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommunicationStyle {
    Joking,
    Supportive,
    Motivating,
    Direct,
    Philosophical,
    Practical,
    Curious,
    Cynical,
    Sarcastic,
    Empathetic,
    Commanding,
    Assertive,
    Possessive,
    Observant,
    #[serde(rename = "Passive-Aggressive")]
    PassiveAggressive,
}

impl CommunicationStyle {
    pub const ALL: [CommunicationStyle; 15] = [
        CommunicationStyle::Joking,
        CommunicationStyle::Supportive,
        CommunicationStyle::Motivating,
        CommunicationStyle::Direct,
        CommunicationStyle::Philosophical,
        CommunicationStyle::Practical,
        CommunicationStyle::Curious,
        CommunicationStyle::Cynical,
        CommunicationStyle::Sarcastic,
        CommunicationStyle::Empathetic,
        CommunicationStyle::Commanding,
        CommunicationStyle::Assertive,
        CommunicationStyle::Possessive,
        CommunicationStyle::Observant,
        CommunicationStyle::PassiveAggressive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommunicationStyle::Joking => "Joking",
            CommunicationStyle::Supportive => "Supportive",
            CommunicationStyle::Motivating => "Motivating",
            CommunicationStyle::Direct => "Direct",
            CommunicationStyle::Philosophical => "Philosophical",
            CommunicationStyle::Practical => "Practical",
            CommunicationStyle::Curious => "Curious",
            CommunicationStyle::Cynical => "Cynical",
            CommunicationStyle::Sarcastic => "Sarcastic",
            CommunicationStyle::Empathetic => "Empathetic",
            CommunicationStyle::Commanding => "Commanding",
            CommunicationStyle::Assertive => "Assertive",
            CommunicationStyle::Possessive => "Possessive",
            CommunicationStyle::Observant => "Observant",
            CommunicationStyle::PassiveAggressive => "Passive-Aggressive",
        }
    }
}

impl FromStr for Formality {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        Formality::ALL
            .iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(raw.trim()))
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Unknown formality level '{}'", raw.trim()))
    }
}

impl FromStr for CommunicationStyle {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        CommunicationStyle::ALL
            .iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(raw.trim()))
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Unknown communication style '{}'", raw.trim()))
    }
}

impl fmt::Display for Formality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for CommunicationStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaSelection {
    #[serde(default)]
    pub traits: Vec<String>,
    pub formality: Formality,
    pub style: CommunicationStyle,
}

impl PersonaSelection {
    /// Reject traits outside the closed vocabulary and normalize the rest.
    pub fn validate(&self) -> Result<Self> {
        let mut traits: Vec<String> = Vec::with_capacity(self.traits.len());
        for raw in &self.traits {
            let normalized = raw.trim().to_lowercase();
            if !CHARACTER_TRAITS.contains(&normalized.as_str()) {
                bail!("Unknown character trait '{}'", raw.trim());
            }
            if !traits.contains(&normalized) {
                traits.push(normalized);
            }
        }
        Ok(Self {
            traits,
            formality: self.formality,
            style: self.style,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub description: String,
    pub behavioral_traits: String,
}

impl Default for PersonaProfile {
    fn default() -> Self {
        Self {
            description: "A versatile chatbot waiting for your personality settings.".to_string(),
            behavioral_traits: "The chatbot will be neutral until specific traits are selected."
                .to_string(),
        }
    }
}

impl PersonaProfile {
    /// Used when profile generation fails.
    pub fn fallback() -> Self {
        Self {
            description: "A friendly and helpful chatbot.".to_string(),
            behavioral_traits: "Responds in a straightforward and polite manner.".to_string(),
        }
    }

    fn ensure_complete(self) -> Result<Self> {
        if self.description.trim().is_empty() || self.behavioral_traits.trim().is_empty() {
            bail!("Generated persona is missing a description or behavioral traits");
        }
        Ok(self)
    }
}

/// Assistant line written to a fresh session's memory after persona generation.
pub fn seed_text(profile: &PersonaProfile) -> String {
    format!("Hello! I am now embodying a new persona: {}", profile.description)
}

pub struct PersonaCompiler {
    model: Arc<dyn ChatModel>,
}

impl PersonaCompiler {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    pub async fn generate_profile(&self, selection: &PersonaSelection) -> Classification<PersonaProfile> {
        let traits = if selection.traits.is_empty() {
            "None specified".to_string()
        } else {
            selection.traits.join(", ")
        };

        let prompt = format!(
            r#"Create a chatbot persona from these characteristics:

Main Character Traits: {traits}
Formality Level: {formality}
Communication Style: {style}

Keep the description concise and true to the combined characteristics. The behavioral traits explain how the chatbot interacts: its tone, its mannerisms, how it treats the user. Do not give the persona a name.

Respond ONLY with JSON:
{{"description": "...", "behavioral_traits": "..."}}"#,
            traits = traits,
            formality = selection.formality,
            style = selection.style,
        );

        let result = complete_json::<PersonaProfile>(self.model.as_ref(), vec![Message::user(prompt)])
            .await
            .and_then(PersonaProfile::ensure_complete);

        let profile = Classification::from_result(result, PersonaProfile::fallback);
        if let Some(reason) = profile.reason() {
            tracing::warn!("Persona generation failed, using fallback profile: {}", reason);
        }
        profile
    }
}

/// Bullet list of retrieved memories, or the literal empty sentinel.
pub fn format_memories(records: &[MemoryRecord]) -> String {
    let lines: Vec<String> = records
        .iter()
        .map(|record| record.text.trim())
        .filter(|text| !text.is_empty())
        .map(|text| format!("- {}", text))
        .collect();

    if lines.is_empty() {
        NO_RELEVANT_MEMORIES.to_string()
    } else {
        lines.join("\n")
    }
}

/// One system instruction from the persona, retrieved context and, when the
/// deployment classifies affect before responding, the user's mood and intent.
pub fn compile_system_instruction(
    profile: &PersonaProfile,
    memories_text: &str,
    mood: Option<&MoodClassification>,
    intent: Option<&IntentClassification>,
) -> String {
    let memories_text = if memories_text.trim().is_empty() {
        NO_RELEVANT_MEMORIES
    } else {
        memories_text
    };

    let mut instruction = format!(
        "You are a chatbot persona. Your identity and behavior are defined by this profile:\n\
         Core Identity: {}\n\
         Behavioral Traits: {}\n",
        profile.description, profile.behavioral_traits
    );

    let has_affect = mood.is_some() || intent.is_some();
    if has_affect {
        instruction.push_str("\nUser's current context:\n");
        if let Some(mood) = mood {
            instruction.push_str(&format!("Mood: {}\n", mood.label()));
        }
        if let Some(intent) = intent {
            instruction.push_str(&format!("Intent: {}\n", intent.label()));
        }
    }

    instruction.push_str(&format!(
        "\nThings you know about the user (use them naturally when they help):\n{}\n",
        memories_text
    ));

    instruction.push_str("\nHow to respond:\n- Always stay in the persona defined above.\n");
    if has_affect {
        instruction.push_str(
            "- Let the user's mood and intent shape your tone: support them when they are low, answer questions within your persona, stay composed when they are upset.\n",
        );
    }
    instruction.push_str(
        "- Weave in what you know about the user when it makes the reply more personal.\n\
         - Keep the conversation flowing and the replies engaging.\n\
         - Never tell the user that you detected their mood or intent, or that you looked anything up in memory.\n",
    );

    instruction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affect::{Intensity, Intent, Mood};
    use async_trait::async_trait;
    use chrono::Utc;

    struct Scripted(&'static str);

    #[async_trait]
    impl ChatModel for Scripted {
        async fn complete(&self, _messages: Vec<Message>) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn selection() -> PersonaSelection {
        PersonaSelection {
            traits: vec!["Calm".to_string(), "logical".to_string(), "calm".to_string()],
            formality: Formality::Formal,
            style: CommunicationStyle::PassiveAggressive,
        }
    }

    #[test]
    fn selection_validation_normalizes_and_rejects_unknown() {
        let validated = selection().validate().unwrap();
        assert_eq!(validated.traits, vec!["calm", "logical"]);

        let mut bad = selection();
        bad.traits.push("grumpy".to_string());
        assert!(bad.validate().unwrap_err().to_string().contains("grumpy"));

        let parsed: PersonaSelection = serde_json::from_str(
            r#"{"traits": [], "formality": "Playful", "style": "Passive-Aggressive"}"#,
        )
        .unwrap();
        assert_eq!(parsed.style, CommunicationStyle::PassiveAggressive);
        assert!(serde_json::from_str::<PersonaSelection>(
            r#"{"formality": "Sloppy", "style": "Joking"}"#
        )
        .is_err());
        assert_eq!("passive-aggressive".parse::<CommunicationStyle>().unwrap(), CommunicationStyle::PassiveAggressive);
    }

    #[tokio::test]
    async fn generation_falls_back_on_bad_output() {
        let compiler = PersonaCompiler::new(Arc::new(Scripted(r#"{"description": "", "behavioral_traits": "x"}"#)));
        let profile = compiler.generate_profile(&selection()).await;
        assert!(profile.is_degraded());
        assert_eq!(profile.into_value(), PersonaProfile::fallback());

        let compiler = PersonaCompiler::new(Arc::new(Scripted(
            r#"{"description": "A measured strategist.", "behavioral_traits": "Speaks in clipped sentences."}"#,
        )));
        let profile = compiler.generate_profile(&selection()).await;
        assert_eq!(profile.value().description, "A measured strategist.");
    }

    #[test]
    fn empty_memories_render_sentinel() {
        assert_eq!(format_memories(&[]), NO_RELEVANT_MEMORIES);
        let instruction = compile_system_instruction(&PersonaProfile::default(), "", None, None);
        assert!(instruction.contains("No relevant memories found."));
        assert!(!instruction.contains("Mood:"));
    }

    #[test]
    fn instruction_carries_memories_and_affect() {
        let records = vec![MemoryRecord {
            id: "1".to_string(),
            text: "Has a cat named Miso".to_string(),
            category: None,
            created_at: Utc::now(),
            session_id: "s".to_string(),
        }];
        let mood = MoodClassification {
            mood: Mood::Sad,
            intensity: Some(Intensity::High),
            reason: None,
        };
        let intent = IntentClassification {
            intent: Intent::Question,
            target: Some("cats".to_string()),
            details: None,
        };
        let instruction = compile_system_instruction(
            &PersonaProfile::fallback(),
            &format_memories(&records),
            Some(&mood),
            Some(&intent),
        );
        assert!(instruction.contains("- Has a cat named Miso"));
        assert!(instruction.contains("Mood: sad (high)"));
        assert!(instruction.contains("Intent: question about cats"));
        assert!(instruction.contains("A friendly and helpful chatbot."));
    }
}
