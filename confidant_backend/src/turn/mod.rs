//! One conversation turn: gate, remember, retrieve, classify, assemble, respond.
//!
//! The orchestrator holds no per-session state. The caller submits the full
//! transcript and persona with every turn and gets the updated transcript back.

pub mod detached;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::bail;
use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::affect::{AffectExtractor, IntentClassification, MoodClassification};
use crate::classification::Classification;
use crate::llm_client::{ChatModel, Message};
use crate::memory::{MemoryGateway, MemoryRecord};
use crate::persona::{compile_system_instruction, format_memories, PersonaProfile, PersonaSelection};
use crate::safety::SafetyGate;
use crate::taxonomy;
use crate::transcript::{extend_with_reply, to_messages, Speaker, Transcript};

pub use detached::{DetachedTasks, Diagnostic, DiagnosticsSink};

/// Memories field reported for refused turns.
pub const REFUSAL_MEMORIES_TEXT: &str = "N/A";

/// Store clocks may lag the orchestrator's by this much.
const ECHO_CLOCK_SKEW_SECS: i64 = 2;

/// When mood and intent are classified relative to response generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AffectMode {
    /// Classify before prompt assembly and condition the instruction on the result.
    #[default]
    Blocking,
    /// Classify alongside generation; the result is only persisted.
    Background,
    Off,
}

impl FromStr for AffectMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "blocking" => Ok(Self::Blocking),
            "background" => Ok(Self::Background),
            "off" | "none" | "disabled" => Ok(Self::Off),
            other => bail!(
                "Unknown affect mode '{}'. Expected 'blocking', 'background' or 'off'",
                other
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub affect_mode: AffectMode,
    pub search_limit: usize,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            affect_mode: AffectMode::Blocking,
            search_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnState {
    Received,
    SafetyChecked,
    Refused,
    MemoryWriteStarted,
    Retrieved,
    AffectClassified,
    PromptAssembled,
    Responding,
    Complete,
}

impl TurnState {
    fn successor_allowed(&self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Received, SafetyChecked)
                | (SafetyChecked, Refused)
                | (SafetyChecked, MemoryWriteStarted)
                | (MemoryWriteStarted, Retrieved)
                | (Retrieved, AffectClassified)
                | (AffectClassified, PromptAssembled)
                | (PromptAssembled, Responding)
                | (Responding, Complete)
        )
    }
}

struct StateTracker {
    session_id: String,
    state: TurnState,
}

impl StateTracker {
    fn new(session_id: &str) -> Self {
        tracing::debug!("Turn for session {} received", session_id);
        Self {
            session_id: session_id.to_string(),
            state: TurnState::Received,
        }
    }

    fn advance(&mut self, next: TurnState) {
        if !self.state.successor_allowed(next) {
            tracing::error!(
                "Turn for session {} made an unexpected transition {:?} -> {:?}",
                self.session_id,
                self.state,
                next
            );
        }
        tracing::debug!("Turn {}: {:?} -> {:?}", self.session_id, self.state, next);
        self.state = next;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub session_id: String,
    #[serde(alias = "prompt")]
    pub utterance: String,
    #[serde(default, alias = "messages")]
    pub transcript: Transcript,
    #[serde(alias = "dynamic_profile")]
    pub persona: PersonaProfile,
    /// The selection the persona was generated from; informational only.
    #[serde(default)]
    pub selection: Option<PersonaSelection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResponse {
    pub assistant_text: String,
    pub updated_transcript: Transcript,
    pub relevant_memories_text: String,
    pub refused: bool,
    pub state: TurnState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnChunk {
    pub fragment_text: String,
    pub cumulative_assistant_text: String,
    pub updated_transcript: Transcript,
    pub relevant_memories_text: String,
}

/// The only failure a turn surfaces; everything upstream of generation degrades.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("response generation failed: {0:#}")]
    Generation(anyhow::Error),
}

pub type TurnStream = BoxStream<'static, Result<TurnChunk, TurnError>>;

struct PreparedTurn {
    session_id: String,
    utterance: String,
    transcript: Transcript,
    messages: Vec<Message>,
    relevant_memories_text: String,
    detached: DetachedTasks,
    tracker: StateTracker,
}

enum Preparation {
    Refused(TurnResponse),
    Ready(PreparedTurn),
}

#[derive(Clone)]
pub struct TurnOrchestrator {
    safety: Arc<dyn SafetyGate>,
    affect: Arc<dyn AffectExtractor>,
    memory: MemoryGateway,
    generator: Arc<dyn ChatModel>,
    diagnostics: DiagnosticsSink,
    options: TurnOptions,
}

impl TurnOrchestrator {
    pub fn new(
        safety: Arc<dyn SafetyGate>,
        affect: Arc<dyn AffectExtractor>,
        memory: MemoryGateway,
        generator: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            safety,
            affect,
            memory,
            generator,
            diagnostics: DiagnosticsSink::default(),
            options: TurnOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TurnOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticsSink) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn options(&self) -> &TurnOptions {
        &self.options
    }

    /// Everything up to and including prompt assembly.
    async fn prepare(&self, request: TurnRequest) -> Preparation {
        let TurnRequest {
            session_id,
            utterance,
            transcript,
            persona,
            ..
        } = request;
        let started_at = Utc::now();
        let mut tracker = StateTracker::new(&session_id);
        let mut detached = DetachedTasks::new(session_id.clone(), self.diagnostics.clone());

        let verdict = self.safety.classify(&utterance).await.into_value();
        tracker.advance(TurnState::SafetyChecked);

        if verdict.is_controversial {
            tracker.advance(TurnState::Refused);
            tracing::info!(
                "Refusing message in session {} (category: {})",
                session_id,
                verdict.category_label()
            );

            let refusal = verdict.refusal_text();
            let memory_text = verdict.refusal_memory_text(&utterance);
            let memory = self.memory.clone();
            let sid = session_id.clone();
            detached.spawn("refusal_write", async move {
                memory
                    .write_episodic(
                        &sid,
                        Speaker::Assistant,
                        &memory_text,
                        Some(taxonomy::CHATBOT_INTERACTIONS),
                    )
                    .await
            });
            detached.join().await;

            return Preparation::Refused(TurnResponse {
                updated_transcript: extend_with_reply(&transcript, &utterance, &refusal),
                assistant_text: refusal,
                relevant_memories_text: REFUSAL_MEMORIES_TEXT.to_string(),
                refused: true,
                state: TurnState::Refused,
            });
        }

        tracker.advance(TurnState::MemoryWriteStarted);
        {
            let memory = self.memory.clone();
            let sid = session_id.clone();
            let text = utterance.clone();
            detached.spawn("episodic_write", async move {
                memory.write_episodic(&sid, Speaker::User, &text, None).await
            });
        }
        {
            let memory = self.memory.clone();
            let sid = session_id.clone();
            let text = utterance.clone();
            detached.spawn("graph_write", async move { memory.write_graph(&sid, &text).await });
        }

        // One extra hit in case this turn's own write is among the results.
        let search = async {
            let hits = self
                .memory
                .search(&session_id, &utterance, self.options.search_limit + 1)
                .await;
            without_own_echo(hits, &utterance, started_at, self.options.search_limit)
        };

        let (records, affect) = match self.options.affect_mode {
            AffectMode::Blocking => {
                let classify = async {
                    tokio::join!(
                        self.affect.classify_mood(&utterance),
                        self.affect.classify_intent(&utterance)
                    )
                };
                let (records, (mood, intent)) = tokio::join!(search, classify);
                tracker.advance(TurnState::Retrieved);

                if let Some(reason) = mood.reason() {
                    tracing::warn!("Mood classification degraded for session {}: {}", session_id, reason);
                } else {
                    self.persist_mood(&mut detached, &session_id, mood.value().clone());
                }
                if let Some(reason) = intent.reason() {
                    tracing::warn!("Intent classification degraded for session {}: {}", session_id, reason);
                }
                (records, Some((mood.into_value(), intent.into_value())))
            }
            AffectMode::Background => {
                let records = search.await;
                tracker.advance(TurnState::Retrieved);

                let affect = Arc::clone(&self.affect);
                let memory = self.memory.clone();
                let sid = session_id.clone();
                let text = utterance.clone();
                detached.spawn("affect_classification", async move {
                    let mood = affect.classify_mood(&text).await;
                    match mood {
                        Classification::Ok(mood) => {
                            memory
                                .write_episodic(&sid, Speaker::User, &mood.memory_text(), Some(taxonomy::USER_MOOD))
                                .await
                        }
                        Classification::Degraded { reason, .. } => {
                            tracing::warn!("Mood classification degraded for session {}: {}", sid, reason);
                            Ok(())
                        }
                    }
                });
                (records, None)
            }
            AffectMode::Off => {
                let records = search.await;
                tracker.advance(TurnState::Retrieved);
                (records, None)
            }
        };
        tracker.advance(TurnState::AffectClassified);

        let relevant_memories_text = format_memories(&records);
        let (mood, intent): (Option<&MoodClassification>, Option<&IntentClassification>) =
            match &affect {
                Some((mood, intent)) => (Some(mood), Some(intent)),
                None => (None, None),
            };
        let instruction = compile_system_instruction(&persona, &relevant_memories_text, mood, intent);
        let messages = to_messages(&instruction, &transcript, &utterance);
        tracker.advance(TurnState::PromptAssembled);

        Preparation::Ready(PreparedTurn {
            session_id,
            utterance,
            transcript,
            messages,
            relevant_memories_text,
            detached,
            tracker,
        })
    }

    fn persist_mood(&self, detached: &mut DetachedTasks, session_id: &str, mood: MoodClassification) {
        let memory = self.memory.clone();
        let sid = session_id.to_string();
        detached.spawn("mood_write", async move {
            memory
                .write_episodic(&sid, Speaker::User, &mood.memory_text(), Some(taxonomy::USER_MOOD))
                .await
        });
    }

    /// Non-streaming turn: the reply is returned once, with the transcript
    /// extended by the user line and the reply.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnResponse, TurnError> {
        let mut turn = match self.prepare(request).await {
            Preparation::Refused(response) => return Ok(response),
            Preparation::Ready(turn) => turn,
        };

        turn.tracker.advance(TurnState::Responding);
        let result = self.generator.complete(turn.messages).await;
        let failures = turn.detached.join().await;
        if failures > 0 {
            tracing::warn!(
                "{} background memory task(s) failed for session {}",
                failures,
                turn.session_id
            );
        }

        let reply = result.map_err(TurnError::Generation)?;
        turn.tracker.advance(TurnState::Complete);

        Ok(TurnResponse {
            updated_transcript: extend_with_reply(&turn.transcript, &turn.utterance, &reply),
            assistant_text: reply,
            relevant_memories_text: turn.relevant_memories_text,
            refused: false,
            state: TurnState::Complete,
        })
    }

    /// Streaming turn. The pipeline runs on its own task, so a consumer that
    /// drops the stream early does not cut off the turn's memory writes.
    pub fn stream_turn(&self, request: TurnRequest) -> TurnStream {
        let (tx, rx) = flume::unbounded();
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.drive_stream(request, tx).await });
        rx.into_stream().boxed()
    }

    async fn drive_stream(
        &self,
        request: TurnRequest,
        tx: flume::Sender<Result<TurnChunk, TurnError>>,
    ) {
        let mut turn = match self.prepare(request).await {
            Preparation::Refused(response) => {
                let _ = tx.send(Ok(TurnChunk {
                    fragment_text: response.assistant_text.clone(),
                    cumulative_assistant_text: response.assistant_text,
                    updated_transcript: response.updated_transcript,
                    relevant_memories_text: response.relevant_memories_text,
                }));
                return;
            }
            Preparation::Ready(turn) => turn,
        };

        turn.tracker.advance(TurnState::Responding);
        let mut completed = false;

        match self.generator.stream(std::mem::take(&mut turn.messages)).await {
            Err(e) => {
                let _ = tx.send(Err(TurnError::Generation(e)));
            }
            Ok(mut fragments) => {
                let mut cumulative = String::new();
                let mut emitted = false;
                let mut failed = false;

                while let Some(fragment) = fragments.next().await {
                    match fragment {
                        Ok(text) => {
                            cumulative.push_str(&text);
                            emitted = true;
                            let chunk = turn.chunk(text, &cumulative);
                            if tx.send(Ok(chunk)).is_err() {
                                tracing::info!(
                                    "Client left session {} mid-stream; finishing memory writes",
                                    turn.session_id
                                );
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(TurnError::Generation(e)));
                            failed = true;
                            break;
                        }
                    }
                }

                if !emitted && !failed {
                    let _ = tx.send(Ok(turn.chunk(String::new(), "")));
                }
                completed = !failed;
            }
        }

        let failures = turn.detached.join().await;
        if failures > 0 {
            tracing::warn!(
                "{} background memory task(s) failed for session {}",
                failures,
                turn.session_id
            );
        }
        if completed {
            turn.tracker.advance(TurnState::Complete);
        }
    }
}

/// Drops records that are this turn's utterance written during the turn.
/// Earlier records with the same text are kept.
fn without_own_echo(
    records: Vec<MemoryRecord>,
    utterance: &str,
    started_at: DateTime<Utc>,
    limit: usize,
) -> Vec<MemoryRecord> {
    let echo = utterance.trim().to_lowercase();
    let cutoff = started_at - Duration::seconds(ECHO_CLOCK_SKEW_SECS);
    records
        .into_iter()
        .filter(|record| !(record.created_at >= cutoff && record.text.trim().to_lowercase() == echo))
        .take(limit)
        .collect()
}

impl PreparedTurn {
    fn chunk(&self, fragment_text: String, cumulative: &str) -> TurnChunk {
        TurnChunk {
            fragment_text,
            cumulative_assistant_text: cumulative.to_string(),
            updated_transcript: extend_with_reply(&self.transcript, &self.utterance, cumulative),
            relevant_memories_text: self.relevant_memories_text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affect::{Intensity, Intent, Mood};
    use crate::llm_client::{FragmentStream, MessageRole};
    use crate::memory::local::LocalMemory;
    use crate::memory::{EpisodicStore, FilterExpression, GraphStore, MemoryRecord, Relation};
    use crate::safety::{SafetyCategory, SafetyVerdict};
    use crate::transcript::Utterance;
    use anyhow::Result;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubSafety {
        verdict: SafetyVerdict,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SafetyGate for StubSafety {
        async fn classify(&self, _text: &str) -> Classification<SafetyVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Classification::Ok(self.verdict.clone())
        }
    }

    struct StubAffect {
        mood: Classification<MoodClassification>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AffectExtractor for StubAffect {
        async fn classify_mood(&self, _text: &str) -> Classification<MoodClassification> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.mood.clone()
        }

        async fn classify_intent(&self, _text: &str) -> Classification<IntentClassification> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Classification::Ok(IntentClassification {
                intent: Intent::Greeting,
                target: None,
                details: None,
            })
        }
    }

    struct StubGenerator {
        fragments: Vec<&'static str>,
        fail: bool,
        calls: AtomicUsize,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl StubGenerator {
        fn replying(fragments: Vec<&'static str>) -> Self {
            Self {
                fragments,
                fail: false,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn system_prompt(&self) -> String {
            let seen = self.seen.lock().unwrap();
            let messages = seen.last().expect("generator was called");
            assert_eq!(messages[0].role, MessageRole::System);
            messages[0].content.clone()
        }
    }

    #[async_trait]
    impl ChatModel for StubGenerator {
        async fn complete(&self, messages: Vec<Message>) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(messages);
            if self.fail {
                anyhow::bail!("model overloaded");
            }
            Ok(self.fragments.concat())
        }

        async fn stream(&self, messages: Vec<Message>) -> Result<FragmentStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(messages);
            if self.fail {
                anyhow::bail!("model overloaded");
            }
            let fragments: Vec<Result<String>> =
                self.fragments.iter().map(|f| Ok(f.to_string())).collect();
            Ok(stream::iter(fragments).boxed())
        }
    }

    /// Local store that counts searches.
    struct CountingStore {
        inner: LocalMemory,
        searches: AtomicUsize,
    }

    #[async_trait]
    impl EpisodicStore for CountingStore {
        fn max_page_size(&self) -> usize {
            self.inner.max_page_size()
        }

        async fn add(&self, session_id: &str, role: Speaker, text: &str, category: Option<&str>) -> Result<()> {
            EpisodicStore::add(&self.inner, session_id, role, text, category).await
        }

        async fn search(&self, session_id: &str, query: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            self.inner.search(session_id, query, limit).await
        }

        async fn query(&self, filter: &FilterExpression, page_size: usize) -> Result<Vec<MemoryRecord>> {
            self.inner.query(filter, page_size).await
        }
    }

    struct DownStore;

    #[async_trait]
    impl EpisodicStore for DownStore {
        fn max_page_size(&self) -> usize {
            50
        }

        async fn add(&self, _: &str, _: Speaker, _: &str, _: Option<&str>) -> Result<()> {
            anyhow::bail!("503 from memory API")
        }

        async fn search(&self, _: &str, _: &str, _: usize) -> Result<Vec<MemoryRecord>> {
            anyhow::bail!("503 from memory API")
        }

        async fn query(&self, _: &FilterExpression, _: usize) -> Result<Vec<MemoryRecord>> {
            anyhow::bail!("503 from memory API")
        }
    }

    #[async_trait]
    impl GraphStore for DownStore {
        async fn add(&self, _: &str, _: &str) -> Result<()> {
            anyhow::bail!("graph unreachable")
        }

        async fn relations(&self, _: &str) -> Result<Vec<Relation>> {
            anyhow::bail!("graph unreachable")
        }
    }

    struct Harness {
        safety: Arc<StubSafety>,
        affect: Arc<StubAffect>,
        generator: Arc<StubGenerator>,
        store: Arc<CountingStore>,
        memory: MemoryGateway,
        orchestrator: TurnOrchestrator,
    }

    fn joyful() -> Classification<MoodClassification> {
        Classification::Ok(MoodClassification {
            mood: Mood::Joyful,
            intensity: Some(Intensity::Medium),
            reason: None,
        })
    }

    fn harness(verdict: SafetyVerdict, generator: StubGenerator, mode: AffectMode) -> Harness {
        let safety = Arc::new(StubSafety {
            verdict,
            calls: AtomicUsize::new(0),
        });
        let affect = Arc::new(StubAffect {
            mood: joyful(),
            calls: AtomicUsize::new(0),
        });
        let generator = Arc::new(generator);
        let local = LocalMemory::in_memory(50).unwrap();
        let store = Arc::new(CountingStore {
            inner: local.clone(),
            searches: AtomicUsize::new(0),
        });
        let memory = MemoryGateway::new(store.clone(), Arc::new(local));
        let orchestrator = TurnOrchestrator::new(
            safety.clone(),
            affect.clone(),
            memory.clone(),
            generator.clone(),
        )
        .with_options(TurnOptions {
            affect_mode: mode,
            search_limit: 3,
        });
        Harness {
            safety,
            affect,
            generator,
            store,
            memory,
            orchestrator,
        }
    }

    fn request(session_id: &str, utterance: &str) -> TurnRequest {
        TurnRequest {
            session_id: session_id.to_string(),
            utterance: utterance.to_string(),
            transcript: vec![
                Utterance::user("hey"),
                Utterance::assistant("Hello! I am now embodying a new persona."),
            ],
            persona: PersonaProfile::fallback(),
            selection: None,
        }
    }

    #[tokio::test]
    async fn controversial_message_is_refused_without_retrieval_or_generation() {
        let h = harness(
            SafetyVerdict::flagged(SafetyCategory::Politics, None),
            StubGenerator::replying(vec!["never used"]),
            AffectMode::Blocking,
        );
        let req = request("s1", "I hate politics, let's not discuss the election");
        let before = req.transcript.len();

        let response = h.orchestrator.run_turn(req).await.unwrap();

        assert!(response.refused);
        assert_eq!(response.state, TurnState::Refused);
        assert!(response.assistant_text.contains("**politics**"));
        assert_eq!(response.updated_transcript.len(), before + 2);
        assert_eq!(
            response.updated_transcript.last(),
            Some(&Utterance::assistant(response.assistant_text.clone()))
        );
        assert_eq!(h.safety.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.affect.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.searches.load(Ordering::SeqCst), 0);

        let logged = h
            .memory
            .query("s1", FilterExpression::category(taxonomy::CHATBOT_INTERACTIONS), 10)
            .await
            .unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(
            logged[0].text,
            "Refused to discuss controversial topic: politics for user message: 'I hate politics, let's not discuss the election'"
        );
    }

    #[tokio::test]
    async fn empty_store_turn_uses_sentinel_and_persists_mood() {
        let h = harness(
            SafetyVerdict::safe(),
            StubGenerator::replying(vec!["Hi! Great to see you."]),
            AffectMode::Blocking,
        );

        let response = h.orchestrator.run_turn(request("s1", "Hello")).await.unwrap();

        assert_eq!(response.state, TurnState::Complete);
        assert_eq!(response.relevant_memories_text, "No relevant memories found.");
        let system = h.generator.system_prompt();
        assert!(system.contains("No relevant memories found."));
        assert!(system.contains("Mood: joyful (medium)"));
        assert!(system.contains("Intent: greeting"));
        assert_eq!(h.affect.calls.load(Ordering::SeqCst), 2);

        let moods = h
            .memory
            .query("s1", FilterExpression::category(taxonomy::USER_MOOD), 50)
            .await
            .unwrap();
        assert_eq!(moods.len(), 1);
        assert!(moods[0].text.contains("joyful"));
    }

    #[tokio::test]
    async fn prompt_replays_transcript_then_new_utterance() {
        let h = harness(
            SafetyVerdict::safe(),
            StubGenerator::replying(vec!["ok"]),
            AffectMode::Off,
        );
        h.orchestrator
            .run_turn(request("s1", "I love jazz music"))
            .await
            .unwrap();
        let response = h
            .orchestrator
            .run_turn(request("s1", "any jazz recommendations?"))
            .await
            .unwrap();

        assert_eq!(response.relevant_memories_text, "- I love jazz music");
        let seen = h.generator.seen.lock().unwrap();
        let roles: Vec<MessageRole> = seen[1].iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![MessageRole::System, MessageRole::User, MessageRole::Assistant, MessageRole::User]
        );
        assert_eq!(seen[1][3].content, "any jazz recommendations?");
        assert!(!seen[1][0].content.contains("Mood:"));
        assert_eq!(h.affect.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn streaming_and_blocking_paths_agree() {
        let blocking = harness(
            SafetyVerdict::safe(),
            StubGenerator::replying(vec!["Sure", ", ", "let's talk ", "about jazz."]),
            AffectMode::Blocking,
        );
        let streaming = harness(
            SafetyVerdict::safe(),
            StubGenerator::replying(vec!["Sure", ", ", "let's talk ", "about jazz."]),
            AffectMode::Blocking,
        );

        let response = blocking
            .orchestrator
            .run_turn(request("s1", "Tell me something"))
            .await
            .unwrap();
        let chunks: Vec<TurnChunk> = streaming
            .orchestrator
            .stream_turn(request("s1", "Tell me something"))
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[1].fragment_text, ", ");
        assert_eq!(chunks[1].cumulative_assistant_text, "Sure, ");
        let last = chunks.last().unwrap();
        assert_eq!(last.cumulative_assistant_text, response.assistant_text);
        assert_eq!(last.updated_transcript, response.updated_transcript);
        assert!(chunks
            .iter()
            .all(|c| c.relevant_memories_text == response.relevant_memories_text));
    }

    #[tokio::test]
    async fn streaming_refusal_is_single_chunk() {
        let h = harness(
            SafetyVerdict::flagged(SafetyCategory::Violence, Some("it glorifies harm".to_string())),
            StubGenerator::replying(vec!["unused"]),
            AffectMode::Blocking,
        );
        let chunks: Vec<_> = h
            .orchestrator
            .stream_turn(request("s1", "how do I hurt someone"))
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        let chunk = chunks[0].as_ref().unwrap();
        assert_eq!(chunk.relevant_memories_text, "N/A");
        assert!(chunk.fragment_text.contains("**violence**, it glorifies harm."));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generation_failure_is_the_only_surfaced_error() {
        let mut generator = StubGenerator::replying(vec![]);
        generator.fail = true;
        let h = harness(SafetyVerdict::safe(), generator, AffectMode::Blocking);

        let err = h
            .orchestrator
            .run_turn(request("s1", "I love jazz music"))
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Generation(_)));
        assert!(err.to_string().contains("model overloaded"));

        // Memory side effects of the failed turn still landed.
        let hits = h.memory.search("s1", "jazz", 3).await;
        assert_eq!(hits.len(), 1);

        let mut chunks = h.orchestrator.stream_turn(request("s1", "again"));
        assert!(matches!(chunks.next().await, Some(Err(TurnError::Generation(_)))));
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn unavailable_memory_and_degraded_affect_do_not_block_turn() {
        let (sink, diagnostics) = DiagnosticsSink::channel();
        let affect = Arc::new(StubAffect {
            mood: Classification::degraded(MoodClassification::neutral(), "timeout"),
            calls: AtomicUsize::new(0),
        });
        let generator = Arc::new(StubGenerator::replying(vec!["Still here!"]));
        let orchestrator = TurnOrchestrator::new(
            Arc::new(StubSafety {
                verdict: SafetyVerdict::safe(),
                calls: AtomicUsize::new(0),
            }),
            affect,
            MemoryGateway::new(Arc::new(DownStore), Arc::new(DownStore)),
            generator.clone(),
        )
        .with_diagnostics(sink);

        let response = orchestrator.run_turn(request("s9", "Hello")).await.unwrap();
        assert_eq!(response.assistant_text, "Still here!");
        assert!(generator.system_prompt().contains("No relevant memories found."));

        let mut tasks: Vec<String> = diagnostics.drain().map(|d| d.task).collect();
        tasks.sort();
        // Degraded mood is not persisted, so only the two user-utterance writes fail.
        assert_eq!(tasks, vec!["episodic_write", "graph_write"]);
    }

    #[tokio::test]
    async fn background_affect_persists_mood_without_conditioning_prompt() {
        let h = harness(
            SafetyVerdict::safe(),
            StubGenerator::replying(vec!["hey"]),
            AffectMode::Background,
        );
        h.orchestrator.run_turn(request("s1", "Hello")).await.unwrap();

        assert!(!h.generator.system_prompt().contains("Mood:"));
        assert_eq!(h.affect.calls.load(Ordering::SeqCst), 1);
        let moods = h
            .memory
            .query("s1", FilterExpression::category(taxonomy::USER_MOOD), 50)
            .await
            .unwrap();
        assert_eq!(moods.len(), 1);
    }

    /// Emits `count` fragments, one every 50ms.
    struct SlowGenerator {
        count: usize,
    }

    #[async_trait]
    impl ChatModel for SlowGenerator {
        async fn complete(&self, _messages: Vec<Message>) -> Result<String> {
            Ok((0..self.count).map(|i| format!("f{} ", i)).collect())
        }

        async fn stream(&self, _messages: Vec<Message>) -> Result<FragmentStream> {
            let count = self.count;
            Ok(stream::unfold(0usize, move |i| async move {
                if i >= count {
                    return None;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Some((Ok::<String, anyhow::Error>(format!("f{} ", i)), i + 1))
            })
            .boxed())
        }
    }

    #[tokio::test]
    async fn dropping_stream_mid_reply_keeps_memory_writes() {
        let local = LocalMemory::in_memory(50).unwrap();
        let memory = MemoryGateway::new(Arc::new(local.clone()), Arc::new(local));
        let orchestrator = TurnOrchestrator::new(
            Arc::new(StubSafety {
                verdict: SafetyVerdict::safe(),
                calls: AtomicUsize::new(0),
            }),
            Arc::new(StubAffect {
                mood: Classification::Ok(MoodClassification {
                    mood: Mood::Joyful,
                    intensity: Some(Intensity::Low),
                    reason: None,
                }),
                calls: AtomicUsize::new(0),
            }),
            memory.clone(),
            Arc::new(SlowGenerator { count: 20 }),
        );

        let mut chunks = orchestrator.stream_turn(request("s1", "I love jazz music"));
        let first = chunks.next().await.unwrap().unwrap();
        assert_eq!(first.fragment_text, "f0 ");
        drop(chunks);

        let mut episodic = Vec::new();
        let mut relations = Vec::new();
        for _ in 0..40 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            episodic = memory
                .query("s1", FilterExpression::any_category(["user_interests", "user_mood"]), 50)
                .await
                .unwrap();
            relations = memory.graph_query("s1").await.unwrap();
            if episodic.len() >= 2 && !relations.is_empty() {
                break;
            }
        }

        let mut texts: Vec<&str> = episodic.iter().map(|r| r.text.as_str()).collect();
        texts.sort();
        assert_eq!(texts, vec!["I love jazz music", "User mood: joyful, intensity low"]);
        assert!(relations
            .iter()
            .any(|r| r.relationship == "loves" && r.target == "jazz music"));
    }

    #[test]
    fn own_echo_is_dropped_but_earlier_repeat_is_kept() {
        let started_at = Utc::now();
        let record = |id: &str, text: &str, created_at: DateTime<Utc>| MemoryRecord {
            id: id.to_string(),
            text: text.to_string(),
            category: None,
            created_at,
            session_id: "s1".to_string(),
        };
        let hits = vec![
            record("own", "I love jazz", started_at + Duration::milliseconds(3)),
            record("yesterday", "i love jazz ", started_at - Duration::days(1)),
            record("other", "Jazz clubs in Lisbon", started_at - Duration::days(2)),
            record("extra", "jazz piano lessons", started_at - Duration::days(3)),
        ];

        let kept = without_own_echo(hits, "I love jazz", started_at, 2);
        let ids: Vec<&str> = kept.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["yesterday", "other"]);
    }

    #[test]
    fn state_machine_rejects_skipping_the_gate() {
        assert!(TurnState::Received.successor_allowed(TurnState::SafetyChecked));
        assert!(!TurnState::Received.successor_allowed(TurnState::Responding));
        assert!(!TurnState::Refused.successor_allowed(TurnState::MemoryWriteStarted));
        assert_eq!("Background".parse::<AffectMode>().unwrap(), AffectMode::Background);
        assert!("eager".parse::<AffectMode>().is_err());
    }
}
