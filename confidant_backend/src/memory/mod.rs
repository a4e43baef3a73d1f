pub mod filter;
pub mod local;
pub mod remote;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transcript::Speaker;

pub use filter::FilterExpression;

/// A memory as returned by a backend. Owned by the backend; read or appended,
/// never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub text: String,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub source: String,
    pub relationship: String,
    #[serde(alias = "destination")]
    pub target: String,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -- {} -- {}", self.source, self.relationship, self.target)
    }
}

/// Similarity- and filter-queryable store of free-text records.
#[async_trait]
pub trait EpisodicStore: Send + Sync {
    /// Largest page the backend accepts for structured queries.
    fn max_page_size(&self) -> usize;

    async fn add(
        &self,
        session_id: &str,
        role: Speaker,
        text: &str,
        category: Option<&str>,
    ) -> Result<()>;

    async fn search(&self, session_id: &str, query: &str, limit: usize)
        -> Result<Vec<MemoryRecord>>;

    /// `filter` is already session-scoped and validated.
    async fn query(&self, filter: &FilterExpression, page_size: usize)
        -> Result<Vec<MemoryRecord>>;
}

/// Entity/relationship store, readable only as a whole-graph fetch per session.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn add(&self, session_id: &str, text: &str) -> Result<()>;

    async fn relations(&self, session_id: &str) -> Result<Vec<Relation>>;
}

/// Uniform front over the two independent, non-transactional stores.
///
/// Writes report failures to the caller (the turn pipeline routes them to its
/// diagnostics sink); `write` is the swallow-and-log variant. `search`
/// degrades to an empty result. Structured reads keep their error so callers
/// can tell "no data yet" from "fetch failed".
#[derive(Clone)]
pub struct MemoryGateway {
    episodic: Arc<dyn EpisodicStore>,
    graph: Arc<dyn GraphStore>,
}

impl MemoryGateway {
    pub fn new(episodic: Arc<dyn EpisodicStore>, graph: Arc<dyn GraphStore>) -> Self {
        Self { episodic, graph }
    }

    pub async fn write_episodic(
        &self,
        session_id: &str,
        role: Speaker,
        text: &str,
        category: Option<&str>,
    ) -> Result<()> {
        self.episodic
            .add(session_id, role, text, category)
            .await
            .with_context(|| format!("episodic write failed for session {}", session_id))
    }

    pub async fn write_graph(&self, session_id: &str, text: &str) -> Result<()> {
        self.graph
            .add(session_id, text)
            .await
            .with_context(|| format!("graph write failed for session {}", session_id))
    }

    /// Best-effort episodic write; failure is logged and dropped. Returns
    /// whether the record was stored.
    pub async fn write(&self, session_id: &str, role: Speaker, text: &str, category: Option<&str>) -> bool {
        match self.write_episodic(session_id, role, text, category).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Could not add memory: {:#}", e);
                false
            }
        }
    }

    pub async fn search(&self, session_id: &str, query: &str, limit: usize) -> Vec<MemoryRecord> {
        match self.episodic.search(session_id, query, limit).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    "Memory search failed for session {}; continuing without context: {:#}",
                    session_id,
                    e
                );
                Vec::new()
            }
        }
    }

    pub async fn query(
        &self,
        session_id: &str,
        filter: FilterExpression,
        page_size: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let scoped = FilterExpression::scoped(session_id, filter);
        scoped.validate().context("Invalid memory filter")?;

        let ceiling = self.episodic.max_page_size();
        let page_size = page_size.clamp(1, ceiling.max(1));
        self.episodic
            .query(&scoped, page_size)
            .await
            .with_context(|| format!("structured memory query failed for session {}", session_id))
    }

    pub async fn graph_query(&self, session_id: &str) -> Result<Vec<Relation>> {
        self.graph
            .relations(session_id)
            .await
            .with_context(|| format!("graph fetch failed for session {}", session_id))
    }
}

/// Backend timestamps arrive as RFC 3339, or naive ISO with optional fraction.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    let without_fraction = raw.split('.').next().unwrap_or(raw);
    NaiveDateTime::parse_from_str(without_fraction, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
