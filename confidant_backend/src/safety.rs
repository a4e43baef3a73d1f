//! Pre-turn content gate for controversial topics.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::classification::Classification;
use crate::llm_client::{complete_json, ChatModel, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCategory {
    Politics,
    Religion,
    Sexual,
    Violence,
    HateSpeech,
}

impl SafetyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyCategory::Politics => "politics",
            SafetyCategory::Religion => "religion",
            SafetyCategory::Sexual => "sexual",
            SafetyCategory::Violence => "violence",
            SafetyCategory::HateSpeech => "hate_speech",
        }
    }

    /// `none`, empty and unrecognized labels all map to `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "politics" | "political" => Some(SafetyCategory::Politics),
            "religion" | "religious" => Some(SafetyCategory::Religion),
            "sexual" | "sex" => Some(SafetyCategory::Sexual),
            "violence" | "violent" => Some(SafetyCategory::Violence),
            "hate_speech" | "hate" => Some(SafetyCategory::HateSpeech),
            _ => None,
        }
    }
}

impl fmt::Display for SafetyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub is_controversial: bool,
    pub category: Option<SafetyCategory>,
    pub reason: Option<String>,
    /// Refusal in the language of the checked message, when the classifier supplied one.
    pub refusal_message: Option<String>,
}

impl SafetyVerdict {
    pub fn safe() -> Self {
        Self {
            is_controversial: false,
            category: None,
            reason: None,
            refusal_message: None,
        }
    }

    pub fn flagged(category: SafetyCategory, reason: Option<String>) -> Self {
        Self {
            is_controversial: true,
            category: Some(category),
            reason,
            refusal_message: None,
        }
    }

    pub fn category_label(&self) -> &'static str {
        self.category.map(|c| c.as_str()).unwrap_or("undefined")
    }

    /// The assistant line shown to the user for a flagged message.
    pub fn refusal_text(&self) -> String {
        if let Some(message) = self
            .refusal_message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
        {
            return message.to_string();
        }

        let reason = self
            .reason
            .as_deref()
            .map(|r| r.trim().trim_end_matches('.'))
            .filter(|r| !r.is_empty())
            .unwrap_or("due to its content");

        format!(
            "I cannot discuss topics related to **{}**, {}. Please let's move on to another topic.",
            self.category_label(),
            reason
        )
    }

    /// Text persisted under `chatbot_interactions` when a message is refused.
    pub fn refusal_memory_text(&self, user_text: &str) -> String {
        format!(
            "Refused to discuss controversial topic: {} for user message: '{}'",
            self.category_label(),
            user_text
        )
    }
}

/// Classifies an utterance before anything else touches it. Never fails:
/// classifier errors come back as a degraded, non-controversial verdict.
#[async_trait]
pub trait SafetyGate: Send + Sync {
    async fn classify(&self, text: &str) -> Classification<SafetyVerdict>;
}

#[derive(Debug, Deserialize)]
struct VerdictWire {
    is_controversial: bool,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    refusal_message: Option<String>,
}

impl From<VerdictWire> for SafetyVerdict {
    fn from(wire: VerdictWire) -> Self {
        let category = wire.category.as_deref().and_then(SafetyCategory::parse);
        Self {
            is_controversial: wire.is_controversial,
            category,
            reason: wire.reason.filter(|r| !r.trim().is_empty()),
            refusal_message: if wire.is_controversial {
                wire.refusal_message.filter(|m| !m.trim().is_empty())
            } else {
                None
            },
        }
    }
}

const SAFETY_INSTRUCTION: &str = r#"You screen chat messages for controversial topics before a companion chatbot answers them.

A message is controversial when it discusses politics, religion, sexual content, violence or hate speech.
Casual mentions that do not invite discussion of the topic are not controversial.

Respond ONLY with JSON:
{"is_controversial": true|false, "category": "politics"|"religion"|"sexual"|"violence"|"hate_speech"|"none", "reason": "short explanation or null", "refusal_message": "polite refusal or null"}

When is_controversial is true, write refusal_message in the SAME LANGUAGE as the user's message. It must name the topic and invite the user to move on to something else."#;

pub struct LlmSafetyGate {
    model: Arc<dyn ChatModel>,
}

impl LlmSafetyGate {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl SafetyGate for LlmSafetyGate {
    async fn classify(&self, text: &str) -> Classification<SafetyVerdict> {
        let messages = vec![
            Message::system(SAFETY_INSTRUCTION),
            Message::user(format!("Message to screen:\n{}", text)),
        ];
        let result = complete_json::<VerdictWire>(self.model.as_ref(), messages)
            .await
            .map(SafetyVerdict::from);

        match result {
            Ok(verdict) => Classification::Ok(verdict),
            Err(e) => {
                let reason = format!("{:#}", e);
                tracing::warn!("Safety classification degraded, allowing message: {}", reason);
                let fallback = SafetyVerdict {
                    reason: Some(format!("Safety check unavailable: {}", reason)),
                    ..SafetyVerdict::safe()
                };
                Classification::degraded(fallback, reason)
            }
        }
    }
}
