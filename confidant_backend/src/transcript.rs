use serde::{Deserialize, Serialize};

use crate::llm_client::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        }
    }
}

/// One stored line of conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    pub role: Speaker,
    #[serde(alias = "content")]
    pub text: String,
}

impl Utterance {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Speaker::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Speaker::Assistant,
            text: text.into(),
        }
    }

    fn to_message(&self) -> Message {
        match self.role {
            Speaker::User => Message::user(self.text.clone()),
            Speaker::Assistant => Message::assistant(self.text.clone()),
        }
    }
}

/// Caller-held, session-scoped conversation history, replayed into every turn.
pub type Transcript = Vec<Utterance>;

/// System instruction, then prior turns in order, then the new user utterance.
pub fn to_messages(instruction: &str, transcript: &[Utterance], utterance: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(transcript.len() + 2);
    messages.push(Message::system(instruction));
    messages.extend(transcript.iter().map(Utterance::to_message));
    messages.push(Message::user(utterance));
    messages
}

/// The transcript as submitted plus this turn's user line and reply.
pub fn extend_with_reply(transcript: &[Utterance], utterance: &str, reply: &str) -> Transcript {
    let mut updated = transcript.to_vec();
    updated.push(Utterance::user(utterance));
    updated.push(Utterance::assistant(reply));
    updated
}
