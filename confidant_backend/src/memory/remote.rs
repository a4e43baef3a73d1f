//! Hosted memory backends: a Mem0-compatible episodic store and a
//! self-hosted graph memory server.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{parse_timestamp, EpisodicStore, FilterExpression, GraphStore, MemoryRecord, Relation};
use crate::taxonomy;
use crate::transcript::Speaker;

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireMemory {
    #[serde(default)]
    id: String,
    #[serde(default, alias = "text")]
    memory: String,
    #[serde(default)]
    categories: Option<Vec<String>>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

impl WireMemory {
    fn into_record(self, fallback_session: &str) -> MemoryRecord {
        MemoryRecord {
            id: self.id,
            text: self.memory,
            category: self.categories.and_then(|tags| tags.into_iter().next()),
            created_at: self
                .created_at
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
            session_id: self.user_id.unwrap_or_else(|| fallback_session.to_string()),
        }
    }
}

/// List endpoints answer either with a bare array or a paginated envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MemoryListing {
    Bare(Vec<WireMemory>),
    Paged { results: Vec<WireMemory> },
}

impl MemoryListing {
    fn into_records(self, fallback_session: &str) -> Vec<MemoryRecord> {
        let items = match self {
            MemoryListing::Bare(items) => items,
            MemoryListing::Paged { results } => results,
        };
        items
            .into_iter()
            .filter(|item| !item.memory.trim().is_empty())
            .map(|item| item.into_record(fallback_session))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct PingResponse {
    org_id: Option<String>,
    project_id: Option<String>,
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read body".to_string());
        anyhow::bail!("{} returned error {}: {}", what, status, body);
    }
    Ok(response)
}

#[derive(Clone)]
pub struct RemoteEpisodicStore {
    base_url: String,
    api_key: String,
    page_size_ceiling: usize,
    client: reqwest::Client,
}

impl RemoteEpisodicStore {
    pub fn new(base_url: &str, api_key: &str, page_size_ceiling: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            page_size_ceiling,
            client: reqwest::Client::new(),
        }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Token {}", self.api_key))
    }

    /// Push the category taxonomy and classification guidance to the project.
    pub async fn provision_project(&self) -> Result<()> {
        let ping = self
            .auth(self.client.get(format!("{}/v1/ping/", self.base_url)))
            .send()
            .await
            .context("Failed to reach memory API")?;
        let ping: PingResponse = check_status(ping, "Memory API ping")
            .await?
            .json()
            .await
            .context("Failed to parse ping response")?;

        let (Some(org_id), Some(project_id)) = (ping.org_id, ping.project_id) else {
            anyhow::bail!("Memory API key is not bound to an organization project");
        };

        let custom_categories: Vec<Value> = taxonomy::CATEGORIES
            .iter()
            .map(|(name, description)| json!({ *name: description }))
            .collect();

        let response = self
            .auth(self.client.patch(format!(
                "{}/api/v1/orgs/organizations/{}/projects/{}/",
                self.base_url, org_id, project_id
            )))
            .json(&json!({
                "custom_categories": custom_categories,
                "custom_instructions": taxonomy::CLASSIFICATION_GUIDANCE,
            }))
            .send()
            .await
            .context("Failed to update memory project")?;
        check_status(response, "Memory project update").await?;

        tracing::info!(
            "Memory project {} provisioned with {} categories",
            project_id,
            taxonomy::CATEGORIES.len()
        );
        Ok(())
    }
}

#[async_trait]
impl EpisodicStore for RemoteEpisodicStore {
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
        let mut body = json!({
            "messages": [WireMessage { role: role.as_str(), content: text }],
            "user_id": session_id,
        });
        if let Some(tag) = category {
            let description = taxonomy::CATEGORIES
                .iter()
                .find(|(name, _)| *name == tag)
                .map(|(_, description)| *description)
                .unwrap_or("Interactions with the chatbot itself.");
            body["custom_categories"] = json!([{ tag: description }]);
            body["metadata"] = json!({ "category": tag });
        }

        let response = self
            .auth(self.client.post(format!("{}/v1/memories/", self.base_url)))
            .json(&body)
            .send()
            .await
            .context("Failed to send memory add request")?;
        check_status(response, "Memory add").await?;
        Ok(())
    }

    async fn search(
        &self,
        session_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let response = self
            .auth(self.client.post(format!("{}/v1/memories/search/", self.base_url)))
            .json(&json!({ "query": query, "user_id": session_id, "limit": limit }))
            .send()
            .await
            .context("Failed to send memory search request")?;

        let listing: MemoryListing = check_status(response, "Memory search")
            .await?
            .json()
            .await
            .context("Failed to parse memory search response")?;

        Ok(listing.into_records(session_id))
    }

    async fn query(
        &self,
        filter: &FilterExpression,
        page_size: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let session_id = filter.session_id().unwrap_or_default().to_string();
        let response = self
            .auth(self.client.post(format!("{}/v2/memories/", self.base_url)))
            .query(&[("page", "1".to_string()), ("page_size", page_size.to_string())])
            .json(&json!({ "filters": filter.to_json() }))
            .send()
            .await
            .context("Failed to send memory list request")?;

        let listing: MemoryListing = check_status(response, "Memory list")
            .await?
            .json()
            .await
            .context("Failed to parse memory list response")?;

        Ok(listing.into_records(&session_id))
    }
}

#[derive(Debug, Deserialize)]
struct GraphListing {
    #[serde(default)]
    relations: Vec<Relation>,
}

#[derive(Clone)]
pub struct RemoteGraphStore {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl RemoteGraphStore {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            client: reqwest::Client::new(),
        }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }
}

#[async_trait]
impl GraphStore for RemoteGraphStore {
    async fn add(&self, session_id: &str, text: &str) -> Result<()> {
        let response = self
            .auth(self.client.post(format!("{}/memories", self.base_url)))
            .json(&json!({
                "messages": [WireMessage { role: "user", content: text }],
                "user_id": session_id,
            }))
            .send()
            .await
            .context("Failed to send graph add request")?;
        check_status(response, "Graph add").await?;
        Ok(())
    }

    async fn relations(&self, session_id: &str) -> Result<Vec<Relation>> {
        let response = self
            .auth(self.client.get(format!("{}/memories", self.base_url)))
            .query(&[("user_id", session_id)])
            .send()
            .await
            .context("Failed to send graph fetch request")?;

        let listing: GraphListing = check_status(response, "Graph fetch")
            .await?
            .json()
            .await
            .context("Failed to parse graph response")?;

        Ok(listing.relations)
    }
}
