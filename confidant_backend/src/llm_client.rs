use std::collections::VecDeque;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

/// Lazy, finite, non-restartable sequence of response text fragments.
pub type FragmentStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// The language-model seam. Every classifier, the persona compiler, the
/// reconstructor and the response generator talk to the model through this.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: Vec<Message>) -> Result<String>;

    /// Stream the completion. Models without native streaming yield the whole
    /// completion as a single fragment.
    async fn stream(&self, messages: Vec<Message>) -> Result<FragmentStream> {
        let text = self.complete(messages).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }
}

/// Run a completion and decode the reply as JSON.
pub async fn complete_json<T>(model: &dyn ChatModel, messages: Vec<Message>) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let response = model.complete(messages).await?;
    parse_json_response(&response)
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model,
            temperature: 0.7,
            max_tokens: 2000,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, messages: &[Message], stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            stream,
        };

        let mut req = self.client.post(&url).json(&request);

        // Add API key header if provided (not needed for local models)
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        // Check for HTTP errors and include response body for debugging
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(&self, messages: Vec<Message>) -> Result<String> {
        let response = self.send(&messages, false).await?;

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }

    async fn stream(&self, messages: Vec<Message>) -> Result<FragmentStream> {
        let response = self
            .send(&messages, true)
            .await
            .context("Failed to open LLM stream")?;

        let state = SseState {
            response,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let fragments = stream::try_unfold(state, next_fragment);

        Ok(fragments.boxed())
    }
}

async fn next_fragment(mut state: SseState) -> Result<Option<(String, SseState)>> {
    loop {
        if let Some(fragment) = state.pending.pop_front() {
            return Ok(Some((fragment, state)));
        }
        if state.done {
            return Ok(None);
        }
        match state
            .response
            .chunk()
            .await
            .context("Failed reading streaming chunk")?
        {
            Some(chunk) => {
                state.buffer.extend_from_slice(&chunk);
                state.drain_lines()?;
            }
            None => {
                // Flush a trailing line that arrived without its newline.
                state.buffer.push(b'\n');
                state.drain_lines()?;
                state.done = true;
            }
        }
    }
}

struct SseState {
    response: reqwest::Response,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl SseState {
    /// Consume every complete line in the buffer, queueing content deltas.
    fn drain_lines(&mut self) -> Result<()> {
        while let Some(newline_idx) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_idx).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(delta) = parse_sse_line(line.trim())? {
                match delta {
                    SseDelta::Content(text) => self.pending.push_back(text),
                    SseDelta::Done => {
                        self.done = true;
                        self.buffer.clear();
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
enum SseDelta {
    Content(String),
    Done,
}

fn parse_sse_line(line: &str) -> Result<Option<SseDelta>> {
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(Some(SseDelta::Done));
    }

    let chunk_json: serde_json::Value = serde_json::from_str(payload)
        .with_context(|| format!("Failed to parse stream payload: {}", payload))?;

    let content = chunk_json["choices"]
        .as_array()
        .and_then(|arr| arr.first())
        .and_then(|choice| choice["delta"]["content"].as_str())
        .filter(|text| !text.is_empty());

    Ok(content.map(|text| SseDelta::Content(text.to_string())))
}

/// Tolerant JSON decoding for model output: raw JSON, `<think>` preambles,
/// fenced ```json blocks, or the outermost `{...}` span.
pub fn parse_json_response<T>(response: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response) {
        return Ok(parsed);
    }

    let cleaned = if let Some(think_end) = response.rfind("</think>") {
        &response[think_end + 8..]
    } else {
        response
    };

    if let Ok(parsed) = serde_json::from_str::<T>(cleaned.trim()) {
        return Ok(parsed);
    }

    let json_content = if let Some(start) = cleaned.find("```json") {
        let after_start = &cleaned[start + 7..];
        if let Some(end) = after_start.find("```") {
            after_start[..end].trim()
        } else {
            cleaned
        }
    } else if let Some(start) = cleaned.find('{') {
        if let Some(end) = cleaned.rfind('}') {
            &cleaned[start..=end]
        } else {
            cleaned
        }
    } else {
        cleaned
    };

    serde_json::from_str::<T>(json_content.trim()).context(format!(
        "Failed to parse JSON. Extracted: {} | Original: {}",
        json_content,
        response.chars().take(500).collect::<String>()
    ))
}
