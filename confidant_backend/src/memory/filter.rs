//! Boolean filter trees for structured memory retrieval.
//!
//! Leaves may only reference the fields a memory backend indexes: the
//! session (partition) id, `created_at`, and the category tag. The same tree
//! is evaluated in-process by the local store and serialized to the
//! `{"AND": [...]}` JSON shape for the hosted one.

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use super::MemoryRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    SessionId,
    CreatedAt,
    Category,
}

impl Field {
    /// Field name on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Field::SessionId => "user_id",
            Field::CreatedAt => "created_at",
            Field::Category => "categories",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String),
    Contains(String),
    Gte(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpression {
    And(Vec<FilterExpression>),
    Or(Vec<FilterExpression>),
    Leaf { field: Field, condition: Condition },
}

impl FilterExpression {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self::Leaf {
            field: Field::SessionId,
            condition: Condition::Eq(session_id.into()),
        }
    }

    pub fn created_since(since: DateTime<Utc>) -> Self {
        Self::Leaf {
            field: Field::CreatedAt,
            condition: Condition::Gte(since),
        }
    }

    pub fn category(tag: impl Into<String>) -> Self {
        Self::Leaf {
            field: Field::Category,
            condition: Condition::Contains(tag.into()),
        }
    }

    /// `category ∈ tags`, as an OR of contains-predicates.
    pub fn any_category<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Or(tags.into_iter().map(Self::category).collect())
    }

    pub fn and(children: Vec<FilterExpression>) -> Self {
        Self::And(children)
    }

    /// Scope `filter` to one session: `session_id AND filter`.
    pub fn scoped(session_id: &str, filter: FilterExpression) -> Self {
        Self::And(vec![Self::session(session_id), filter])
    }

    /// Reject operators a field cannot be indexed by, and empty junctions.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::And(children) | Self::Or(children) => {
                if children.is_empty() {
                    bail!("Filter junction must have at least one child");
                }
                children.iter().try_for_each(Self::validate)
            }
            Self::Leaf { field, condition } => match (field, condition) {
                (Field::SessionId, Condition::Eq(value))
                | (Field::Category, Condition::Eq(value))
                | (Field::Category, Condition::Contains(value)) => {
                    if value.trim().is_empty() {
                        bail!("Filter on '{}' has an empty value", field.wire_name());
                    }
                    Ok(())
                }
                (Field::CreatedAt, Condition::Gte(_)) => Ok(()),
                (field, condition) => bail!(
                    "Operator {:?} is not supported on field '{}'",
                    condition,
                    field.wire_name()
                ),
            },
        }
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        match self {
            Self::And(children) => children.iter().all(|c| c.matches(record)),
            Self::Or(children) => children.iter().any(|c| c.matches(record)),
            Self::Leaf { field, condition } => match (field, condition) {
                (Field::SessionId, Condition::Eq(value)) => record.session_id == *value,
                (Field::Category, Condition::Eq(value))
                | (Field::Category, Condition::Contains(value)) => {
                    record.category.as_deref() == Some(value.as_str())
                }
                (Field::CreatedAt, Condition::Gte(since)) => record.created_at >= *since,
                _ => false,
            },
        }
    }

    /// The session id pinned by a top-level equality leaf, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Leaf {
                field: Field::SessionId,
                condition: Condition::Eq(value),
            } => Some(value),
            Self::And(children) => children.iter().find_map(Self::session_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::And(children) => json!({ "AND": children.iter().map(Self::to_json).collect::<Vec<_>>() }),
            Self::Or(children) => json!({ "OR": children.iter().map(Self::to_json).collect::<Vec<_>>() }),
            Self::Leaf { field, condition } => {
                let name = field.wire_name();
                match condition {
                    Condition::Eq(value) if *field == Field::SessionId => json!({ name: value }),
                    Condition::Eq(value) => json!({ name: { "eq": value } }),
                    Condition::Contains(value) => json!({ name: { "contains": value } }),
                    Condition::Gte(since) => json!({
                        name: { "gte": since.to_rfc3339_opts(SecondsFormat::Secs, true) }
                    }),
                }
            }
        }
    }
}
