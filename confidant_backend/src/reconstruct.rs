//! Read-only views derived from stored memory: user profile, proactive
//! re-engagement message, topic suggestion and mood timeline.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::affect::{AffectExtractor, Mood};
use crate::classification::Classification;
use crate::config::BackendConfig;
use crate::llm_client::{complete_json, ChatModel, Message};
use crate::memory::{FilterExpression, MemoryGateway, MemoryRecord};
use crate::taxonomy;

pub const NO_PROFILE_SUMMARY: &str = "No personal information found.";
pub const PROACTIVE_FALLBACK: &str = "It's been a little while! How have things been going lately?";
pub const TOPIC_EMPTY: &str =
    "It seems we haven't discussed your favorite topics yet! What's on your mind today?";
pub const TOPIC_FAILURE: &str = "I'm having a bit of trouble coming up with a new topic right now. Is there anything specific you'd like to talk about?";

#[derive(Debug, Clone)]
pub struct ReconstructorOptions {
    pub profile_categories: Vec<String>,
    pub proactive_categories: Vec<String>,
    pub topic_categories: Vec<String>,
    pub proactive_window_days: i64,
    pub mood_window_days: i64,
    pub profile_page_size: usize,
    pub proactive_page_size: usize,
    pub mood_page_size: usize,
    pub topic_page_size: usize,
}

impl From<&BackendConfig> for ReconstructorOptions {
    fn from(config: &BackendConfig) -> Self {
        Self {
            profile_categories: config.profile_categories.clone(),
            proactive_categories: config.proactive_categories.clone(),
            topic_categories: config.topic_categories.clone(),
            proactive_window_days: config.proactive_window_days,
            mood_window_days: config.mood_window_days,
            profile_page_size: config.profile_page_size,
            proactive_page_size: config.proactive_page_size,
            mood_page_size: config.mood_page_size,
            topic_page_size: config.topic_page_size,
        }
    }
}

impl Default for ReconstructorOptions {
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

/// Where a derived view reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    #[default]
    Vector,
    Graph,
}

impl FromStr for MemorySource {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "vector" | "episodic" => Ok(Self::Vector),
            "graph" => Ok(Self::Graph),
            other => bail!("Unknown memory source '{}'. Expected 'vector' or 'graph'", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: Option<String>,
    pub summary: String,
}

impl UserProfile {
    pub fn empty() -> Self {
        Self {
            name: None,
            summary: NO_PROFILE_SUMMARY.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProfileWire {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodPoint {
    pub time: DateTime<Utc>,
    pub mood: Mood,
    pub score: f64,
}

pub struct Reconstructor {
    memory: MemoryGateway,
    affect: Arc<dyn AffectExtractor>,
    model: Arc<dyn ChatModel>,
    options: ReconstructorOptions,
}

impl Reconstructor {
    pub fn new(
        memory: MemoryGateway,
        affect: Arc<dyn AffectExtractor>,
        model: Arc<dyn ChatModel>,
        options: ReconstructorOptions,
    ) -> Self {
        Self {
            memory,
            affect,
            model,
            options,
        }
    }

    /// Source lines for a view: record texts, or rendered graph relations.
    async fn source_lines(
        &self,
        session_id: &str,
        source: MemorySource,
        filter: FilterExpression,
        page_size: usize,
    ) -> Result<Vec<String>> {
        let lines = match source {
            MemorySource::Vector => self
                .memory
                .query(session_id, filter, page_size)
                .await?
                .into_iter()
                .map(|record| record.text)
                .collect::<Vec<_>>(),
            MemorySource::Graph => self
                .memory
                .graph_query(session_id)
                .await?
                .iter()
                .map(|relation| relation.to_string())
                .collect(),
        };
        Ok(lines
            .into_iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    /// Summarize what memory holds about the user. Fetch failures are errors;
    /// summarizer failures are reported inside the profile.
    pub async fn profile(&self, session_id: &str, source: MemorySource) -> Result<UserProfile> {
        let filter = FilterExpression::any_category(self.options.profile_categories.iter().cloned());
        let lines = self
            .source_lines(session_id, source, filter, self.options.profile_page_size)
            .await?;
        if lines.is_empty() {
            return Ok(UserProfile::empty());
        }

        let prompt = format!(
            r#"Based on the following fragmented memories about a user, write a coherent personal profile.
Extract the user's name if it is known and a brief overall summary of who they are: interests, preferences, relationships and outlook.

User memories:
{}

Respond ONLY with JSON:
{{"name": "name or null", "summary": "..."}}"#,
            lines.join("\n")
        );

        let result = complete_json::<ProfileWire>(self.model.as_ref(), vec![Message::user(prompt)])
            .await
            .and_then(|wire| match wire.summary.filter(|s| !s.trim().is_empty()) {
                Some(summary) => Ok(UserProfile {
                    name: wire.name.filter(|n| !n.trim().is_empty()),
                    summary,
                }),
                None => bail!("summarizer returned no summary"),
            });

        Ok(match result {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!("Profile synthesis failed for session {}: {:#}", session_id, e);
                UserProfile {
                    name: None,
                    summary: format!("Could not generate profile: {:#}", e),
                }
            }
        })
    }

    /// One message to re-open the conversation, built from recent life context.
    pub async fn proactive_query(&self, session_id: &str, source: MemorySource) -> Result<String> {
        let since = Utc::now() - Duration::days(self.options.proactive_window_days);
        let filter = FilterExpression::and(vec![
            FilterExpression::created_since(since),
            FilterExpression::any_category(self.options.proactive_categories.iter().cloned()),
        ]);
        let lines = self
            .source_lines(session_id, source, filter, self.options.proactive_page_size)
            .await?;
        if lines.is_empty() {
            return Ok(PROACTIVE_FALLBACK.to_string());
        }

        let prompt = format!(
            r#"You are a caring companion chatbot reaching out to a user you have not heard from in a while.
Here is what you remember about their recent life:
{}

Write ONE short, warm message that checks in on something specific from these memories and invites them to share how it went.
Do not mention that you have memories or notes. Reply with the message only."#,
            lines.join("\n")
        );

        match self.model.complete(vec![Message::user(prompt)]).await {
            Ok(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(_) => Ok(PROACTIVE_FALLBACK.to_string()),
            Err(e) => {
                tracing::warn!("Proactive query generation failed for session {}: {:#}", session_id, e);
                Ok(PROACTIVE_FALLBACK.to_string())
            }
        }
    }

    pub async fn suggest_topic(&self, session_id: &str) -> Result<String> {
        let filter = FilterExpression::any_category(self.options.topic_categories.iter().cloned());
        let lines = self
            .source_lines(session_id, MemorySource::Vector, filter, self.options.topic_page_size)
            .await?;
        if lines.is_empty() {
            return Ok(TOPIC_EMPTY.to_string());
        }

        let prompt = format!(
            r#"Based on these things the user has shown interest in, suggest ONE specific conversation topic.
Make it sound natural and engaging, the way a friendly chatbot would bring it up. Do not list the topics back.

User's interests:
{}

Example: "Since you mentioned your love for space exploration, how about we dive into the latest Mars rover discoveries?""#,
            lines.join(", ")
        );

        match self.model.complete(vec![Message::user(prompt)]).await {
            Ok(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(_) => Ok(TOPIC_FAILURE.to_string()),
            Err(e) => {
                tracing::warn!("Topic suggestion failed for session {}: {:#}", session_id, e);
                Ok(TOPIC_FAILURE.to_string())
            }
        }
    }

    /// Re-derive `(time, mood, score)` points from stored mood records.
    ///
    /// Stored mood text is not guaranteed to be structured, because older
    /// records predate the current `memory_text` format. Each record goes
    /// through the mood classifier first; only when that degrades do we scan
    /// the text for a known mood word, and only then fall back to neutral.
    pub async fn mood_timeline(&self, session_id: &str) -> Result<Vec<MoodPoint>> {
        let since = Utc::now() - Duration::days(self.options.mood_window_days);
        let filter = FilterExpression::and(vec![
            FilterExpression::created_since(since),
            FilterExpression::category(taxonomy::USER_MOOD),
        ]);
        let records = self
            .memory
            .query(session_id, filter, self.options.mood_page_size)
            .await?;

        let mut points = join_all(records.iter().map(|record| self.recover_mood(record))).await;
        points.sort_by_key(|point| point.time);
        Ok(points)
    }

    async fn recover_mood(&self, record: &MemoryRecord) -> MoodPoint {
        let mood = match self.affect.classify_mood(&record.text).await {
            Classification::Ok(classification) => classification.mood,
            Classification::Degraded { reason, .. } => {
                let found = Mood::find_in_text(&record.text);
                tracing::debug!(
                    "Mood classifier degraded on record {} ({}); text match gave {:?}",
                    record.id,
                    reason,
                    found
                );
                found.unwrap_or(Mood::Neutral)
            }
        };
        MoodPoint {
            time: record.created_at,
            mood,
            score: mood.score(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affect::{Intensity, IntentClassification, MoodClassification};
    use crate::memory::local::LocalMemory;
    use crate::memory::{EpisodicStore, GraphStore, Relation};
    use crate::persona::PersonaProfile;
    use crate::safety::{SafetyGate, SafetyVerdict};
    use crate::transcript::Speaker;
    use crate::turn::{TurnOrchestrator, TurnRequest};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted(&'static str);

    #[async_trait]
    impl ChatModel for Scripted {
        async fn complete(&self, _messages: Vec<Message>) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Offline;

    #[async_trait]
    impl ChatModel for Offline {
        async fn complete(&self, _messages: Vec<Message>) -> Result<String> {
            bail!("model offline")
        }
    }

    /// Classifies by looking for "joy", degrades on everything else.
    struct KeywordAffect {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AffectExtractor for KeywordAffect {
        async fn classify_mood(&self, text: &str) -> Classification<MoodClassification> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.contains("joy") || text == "Hello" {
                Classification::Ok(MoodClassification {
                    mood: Mood::Joyful,
                    intensity: Some(Intensity::Medium),
                    reason: None,
                })
            } else {
                Classification::degraded(MoodClassification::neutral(), "unparseable")
            }
        }

        async fn classify_intent(&self, _text: &str) -> Classification<IntentClassification> {
            Classification::Ok(IntentClassification::statement())
        }
    }

    struct AllowAll;

    #[async_trait]
    impl SafetyGate for AllowAll {
        async fn classify(&self, _text: &str) -> Classification<SafetyVerdict> {
            Classification::Ok(SafetyVerdict::safe())
        }
    }

    fn local_gateway() -> (LocalMemory, MemoryGateway) {
        let local = LocalMemory::in_memory(50).unwrap();
        let gateway = MemoryGateway::new(Arc::new(local.clone()), Arc::new(local.clone()));
        (local, gateway)
    }

    fn reconstructor(memory: MemoryGateway, model: Arc<dyn ChatModel>) -> Reconstructor {
        Reconstructor::new(
            memory,
            Arc::new(KeywordAffect {
                calls: AtomicUsize::new(0),
            }),
            model,
            ReconstructorOptions::default(),
        )
    }

    #[tokio::test]
    async fn profile_over_no_records_is_explicit_empty_profile() {
        let (_, memory) = local_gateway();
        let reconstructor = reconstructor(memory, Arc::new(Offline));
        let profile = reconstructor.profile("nobody", MemorySource::Vector).await.unwrap();
        assert_eq!(
            profile,
            UserProfile {
                name: None,
                summary: "No personal information found.".to_string()
            }
        );
        let graph = reconstructor.profile("nobody", MemorySource::Graph).await.unwrap();
        assert_eq!(graph, UserProfile::empty());
    }

    #[tokio::test]
    async fn profile_summarizer_failure_is_reported_in_summary() {
        let (local, memory) = local_gateway();
        EpisodicStore::add(&local, "s1", Speaker::User, "My name is Ana", Some("personal_details"))
            .await
            .unwrap();

        let profile = reconstructor(memory.clone(), Arc::new(Offline))
            .profile("s1", MemorySource::Vector)
            .await
            .unwrap();
        assert_eq!(profile.name, None);
        assert_eq!(profile.summary, "Could not generate profile: model offline");

        let profile = reconstructor(
            memory,
            Arc::new(Scripted(r#"{"name": "Ana", "summary": "Ana is a nurse who loves jazz."}"#)),
        )
        .profile("s1", MemorySource::Vector)
        .await
        .unwrap();
        assert_eq!(profile.name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn proactive_query_falls_back_without_recent_context() {
        let (local, memory) = local_gateway();
        // Outside the proactive category set.
        EpisodicStore::add(&local, "s1", Speaker::User, "I think pineapple belongs on pizza", Some("opinions"))
            .await
            .unwrap();
        let reconstructor = reconstructor(memory, Arc::new(Scripted("How did the move go?")));
        assert_eq!(
            reconstructor.proactive_query("s1", MemorySource::Vector).await.unwrap(),
            PROACTIVE_FALLBACK
        );

        EpisodicStore::add(&local, "s1", Speaker::User, "I moved to Lisbon last week", Some("life_events"))
            .await
            .unwrap();
        assert_eq!(
            reconstructor.proactive_query("s1", MemorySource::Vector).await.unwrap(),
            "How did the move go?"
        );
    }

    #[tokio::test]
    async fn graph_sourced_views_render_relations() {
        let (local, memory) = local_gateway();
        GraphStore::add(&local, "s1", "I work at Globex").await.unwrap();
        let relations: Vec<Relation> = memory.graph_query("s1").await.unwrap();
        assert_eq!(relations.len(), 1);

        let reconstructor = reconstructor(memory, Arc::new(Scripted("How is Globex treating you?")));
        assert_eq!(
            reconstructor.proactive_query("s1", MemorySource::Graph).await.unwrap(),
            "How is Globex treating you?"
        );
    }

    #[tokio::test]
    async fn topic_suggestion_fallbacks() {
        let (local, memory) = local_gateway();
        let offline = reconstructor(memory.clone(), Arc::new(Offline));
        assert_eq!(offline.suggest_topic("s1").await.unwrap(), TOPIC_EMPTY);

        EpisodicStore::add(&local, "s1", Speaker::User, "Learning Japanese", Some("learning"))
            .await
            .unwrap();
        assert_eq!(offline.suggest_topic("s1").await.unwrap(), TOPIC_FAILURE);
    }

    #[tokio::test]
    async fn mood_timeline_uses_classifier_then_text_match_then_neutral() {
        let (local, memory) = local_gateway();
        for text in ["pure joy today", "User mood: sad, intensity high", "meh"] {
            EpisodicStore::add(&local, "s1", Speaker::User, text, Some("user_mood"))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        EpisodicStore::add(&local, "s1", Speaker::User, "angry about traffic", Some("challenges"))
            .await
            .unwrap();

        let timeline = reconstructor(memory, Arc::new(Offline))
            .mood_timeline("s1")
            .await
            .unwrap();
        let moods: Vec<(Mood, f64)> = timeline.iter().map(|p| (p.mood, p.score)).collect();
        assert_eq!(
            moods,
            vec![(Mood::Joyful, 5.0), (Mood::Sad, 1.0), (Mood::Neutral, 3.0)]
        );
        assert!(timeline.windows(2).all(|w| w[0].time <= w[1].time));
    }

    #[tokio::test]
    async fn mood_timeline_fetch_failure_is_an_error_not_empty() {
        let (local, _) = local_gateway();
        struct Down;
        #[async_trait]
        impl EpisodicStore for Down {
            fn max_page_size(&self) -> usize {
                50
            }
            async fn add(&self, _: &str, _: Speaker, _: &str, _: Option<&str>) -> Result<()> {
                Ok(())
            }
            async fn search(&self, _: &str, _: &str, _: usize) -> Result<Vec<MemoryRecord>> {
                Ok(Vec::new())
            }
            async fn query(&self, _: &FilterExpression, _: usize) -> Result<Vec<MemoryRecord>> {
                bail!("timeout")
            }
        }
        let memory = MemoryGateway::new(Arc::new(Down), Arc::new(local));
        let reconstructor = reconstructor(memory, Arc::new(Offline));
        assert!(reconstructor.mood_timeline("s1").await.is_err());
        assert!(reconstructor.profile("s1", MemorySource::Vector).await.is_err());
    }

    #[tokio::test]
    async fn hello_turn_yields_single_joyful_point_in_mood_history() {
        let (_, memory) = local_gateway();
        let affect = Arc::new(KeywordAffect {
            calls: AtomicUsize::new(0),
        });
        let orchestrator = TurnOrchestrator::new(
            Arc::new(AllowAll),
            affect.clone(),
            memory.clone(),
            Arc::new(Scripted("Hi there!")),
        );

        let response = orchestrator
            .run_turn(TurnRequest {
                session_id: "s1".to_string(),
                utterance: "Hello".to_string(),
                transcript: Vec::new(),
                persona: PersonaProfile::default(),
                selection: None,
            })
            .await
            .unwrap();
        assert_eq!(response.relevant_memories_text, "No relevant memories found.");

        let reconstructor = Reconstructor::new(
            memory,
            affect,
            Arc::new(Offline),
            ReconstructorOptions::default(),
        );
        let timeline = reconstructor.mood_timeline("s1").await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].mood, Mood::Joyful);
        assert_eq!(timeline[0].score, 5.0);
    }
}
