//! SQLite-backed episodic and graph stores sharing one database file.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};

use super::{parse_timestamp, EpisodicStore, FilterExpression, GraphStore, MemoryRecord, Relation};
use crate::taxonomy;
use crate::transcript::Speaker;

#[derive(Clone)]
pub struct LocalMemory {
    conn: Arc<Mutex<Connection>>,
    page_size_ceiling: usize,
}

impl LocalMemory {
    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P, page_size_ceiling: usize) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open memory database {:?}", path.as_ref()))?;
        Self::from_connection(conn, page_size_ceiling)
    }

    pub fn in_memory(page_size_ceiling: usize) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, page_size_ceiling)
    }

    fn from_connection(conn: Connection, page_size_ceiling: usize) -> Result<Self> {
        let memory = Self {
            conn: Arc::new(Mutex::new(conn)),
            page_size_ceiling,
        };
        memory.ensure_schema()?;
        Ok(memory)
    }

    fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
        conn.lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = Self::lock(&self.conn)?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS episodic_memories (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                text TEXT NOT NULL,
                category TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_episodic_session_created
             ON episodic_memories(session_id, created_at)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS graph_relations (
                session_id TEXT NOT NULL,
                source TEXT NOT NULL,
                relationship TEXT NOT NULL,
                target TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(session_id, source, relationship, target)
            )"#,
            [],
        )?;

        Ok(())
    }

    /// Run a blocking closure against the connection off the async executor.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = Self::lock(&conn)?;
            f(&guard)
        })
        .await
        .context("Memory database task panicked")?
    }

    fn session_records(conn: &Connection, session_id: &str) -> Result<Vec<MemoryRecord>> {
        let mut stmt = conn.prepare(
            "SELECT id, text, category, created_at, session_id
             FROM episodic_memories
             WHERE session_id = ?1
             ORDER BY created_at DESC",
        )?;

        let rows = stmt
            .query_map([session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(id, text, category, created_at, session_id)| MemoryRecord {
                created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
                id,
                text,
                category,
                session_id,
            })
            .collect())
    }
}

#[async_trait]
impl EpisodicStore for LocalMemory {
    fn max_page_size(&self) -> usize {
        self.page_size_ceiling
    }

    async fn add(
        &self,
        session_id: &str,
        role: Speaker,
        text: &str,
        category: Option<&str>,
    ) -> Result<()> {
        let category = match category {
            Some(tag) => Some(tag.to_string()),
            None if role == Speaker::User => infer_category(text).map(str::to_string),
            None => None,
        };
        let id = uuid::Uuid::new_v4().to_string();
        let session_id = session_id.to_string();
        let text = text.to_string();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO episodic_memories (id, session_id, role, text, category, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, session_id, role.as_str(), text, category, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn search(
        &self,
        session_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let session_id = session_id.to_string();
        let query = query.to_string();

        self.with_conn(move |conn| {
            let records = Self::session_records(conn, &session_id)?;
            Ok(rank_by_overlap(records, &query, limit))
        })
        .await
    }

    async fn query(
        &self,
        filter: &FilterExpression,
        page_size: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let session_id = filter
            .session_id()
            .map(str::to_string)
            .context("Local memory queries must be scoped to a session")?;
        let filter = filter.clone();

        self.with_conn(move |conn| {
            let records = Self::session_records(conn, &session_id)?;
            Ok(records
                .into_iter()
                .filter(|record| filter.matches(record))
                .take(page_size)
                .collect())
        })
        .await
    }
}

#[async_trait]
impl GraphStore for LocalMemory {
    async fn add(&self, session_id: &str, text: &str) -> Result<()> {
        let relations = extract_relations(text);
        if relations.is_empty() {
            return Ok(());
        }
        let session_id = session_id.to_string();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        self.with_conn(move |conn| {
            for relation in &relations {
                conn.execute(
                    "INSERT OR IGNORE INTO graph_relations (session_id, source, relationship, target, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        session_id,
                        relation.source,
                        relation.relationship,
                        relation.target,
                        now
                    ],
                )?;
            }
            Ok(())
        })
        .await
    }

    async fn relations(&self, session_id: &str) -> Result<Vec<Relation>> {
        let session_id = session_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT source, relationship, target
                 FROM graph_relations
                 WHERE session_id = ?1
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let relations = stmt
                .query_map([session_id], |row| {
                    Ok(Relation {
                        source: row.get(0)?,
                        relationship: row.get(1)?,
                        target: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(relations)
        })
        .await
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 3)
        .map(|word| word.to_lowercase())
        .collect()
}

/// Term-overlap similarity, newest first among equal scores.
fn rank_by_overlap(records: Vec<MemoryRecord>, query: &str, limit: usize) -> Vec<MemoryRecord> {
    let query_terms = terms(query);
    if query_terms.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(usize, MemoryRecord)> = records
        .into_iter()
        .filter_map(|record| {
            let overlap = terms(&record.text).intersection(&query_terms).count();
            (overlap > 0).then_some((overlap, record))
        })
        .collect();

    // Stable sort keeps newest-first among equal scores.
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().take(limit).map(|(_, record)| record).collect()
}

/// Keyword tagging for user statements, standing in for the hosted backend's
/// server-side categorization.
fn infer_category(text: &str) -> Option<&'static str> {
    let rules = [
        (r"(?i)\b(my name is|call me|i am \d+|i'm \d+|years old|i live in)\b", taxonomy::PERSONAL_DETAILS),
        (r"(?i)\b(my (mom|mother|dad|father|sister|brother|friend|friends|son|daughter|family|cousin|grandma|grandpa))\b", taxonomy::RELATIONSHIPS),
        (r"(?i)\b(my (job|boss|manager|office|company|salary|coworker|colleague)|i work)\b", taxonomy::PROFESSIONAL_DETAILS),
        (r"(?i)\b(favorite|favourite)\b", taxonomy::FAVORITES),
        (r"(?i)\b(learning|studying|i want to learn|course|lesson)\b", taxonomy::LEARNING),
        (r"(?i)\b(every (day|morning|evening|night|week)|usually|each morning|my routine)\b", taxonomy::DAILY_ROUTINE),
        (r"(?i)\b(graduated|moved to|got married|got engaged|new job|was born|retired|had a baby)\b", taxonomy::LIFE_EVENTS),
        (r"(?i)\b(i plan|i'm planning|next year|someday|my goal)\b", taxonomy::FUTURE_PLANS),
        (r"(?i)\b(i think|i believe|in my opinion)\b", taxonomy::OPINIONS),
        (r"(?i)\b(hobby|hobbies|i enjoy|i love|i like|passionate about)\b", taxonomy::USER_INTERESTS),
        (r"(?i)\b(i prefer|i hate|i dislike|i can't stand)\b", taxonomy::USER_PREFERENCES),
        (r"(?i)\b(doctor|sick|illness|headache|therapy|diagnosed)\b", taxonomy::HEALTH),
    ];

    for (pattern, category) in rules {
        if let Ok(re) = regex_lite::Regex::new(pattern) {
            if re.is_match(text) {
                return Some(category);
            }
        }
    }
    None
}

fn clean_object(raw: &str) -> Option<String> {
    let object = raw
        .trim()
        .trim_end_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    let words: Vec<&str> = object.split_whitespace().take(6).collect();
    (!words.is_empty()).then(|| words.join(" "))
}

/// Pull `user -- relationship -- object` triples out of first-person statements.
pub(crate) fn extract_relations(text: &str) -> Vec<Relation> {
    let mut relations = Vec::new();
    let mut push = |relationship: String, object: &str| {
        if let Some(target) = clean_object(object) {
            let relation = Relation {
                source: "user".to_string(),
                relationship,
                target,
            };
            if !relations.contains(&relation) {
                relations.push(relation);
            }
        }
    };

    for sentence in text.split(|c| matches!(c, '.' | '!' | '?' | ';' | '\n')) {
        if let Ok(re) = regex_lite::Regex::new(r"(?i)\bmy ([a-z]+(?: [a-z]+)?) is ([^,]+)") {
            for caps in re.captures_iter(sentence) {
                let attribute = caps[1].to_lowercase().replace(' ', "_");
                push(format!("has_{}", attribute), &caps[2]);
            }
        }
        if let Ok(re) = regex_lite::Regex::new(r"(?i)\bi (like|love|hate|enjoy|prefer|dislike) ([^,]+)") {
            for caps in re.captures_iter(sentence) {
                push(format!("{}s", caps[1].to_lowercase()), &caps[2]);
            }
        }
        if let Ok(re) = regex_lite::Regex::new(r"(?i)\bi work (?:at|for) ([^,]+)") {
            for caps in re.captures_iter(sentence) {
                push("works_at".to_string(), &caps[1]);
            }
        }
        if let Ok(re) = regex_lite::Regex::new(r"(?i)\bi live in ([^,]+)") {
            for caps in re.captures_iter(sentence) {
                push("lives_in".to_string(), &caps[1]);
            }
        }
        if let Ok(re) = regex_lite::Regex::new(r"(?i)\b(?:i am|i'm) an? ([^,]+)") {
            for caps in re.captures_iter(sentence) {
                push("is_a".to_string(), &caps[1]);
            }
        }
    }

    relations
}
