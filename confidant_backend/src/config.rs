use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use crate::taxonomy;
use crate::turn::AffectMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryBackendKind {
    /// SQLite-backed episodic + graph stores in a single local file.
    #[default]
    Local,
    /// Mem0-compatible hosted episodic store plus a graph memory server.
    Remote,
}

impl FromStr for MemoryBackendKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" | "sqlite" => Ok(Self::Local),
            "remote" | "mem0" => Ok(Self::Remote),
            other => bail!("Unknown memory backend '{}'. Expected 'local' or 'remote'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub llm_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub llm_max_tokens: u32,

    // Memory backends
    #[serde(default)]
    pub memory_backend: MemoryBackendKind,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub memory_api_url: Option<String>,
    #[serde(default)]
    pub memory_api_key: Option<String>,
    #[serde(default)]
    pub graph_api_url: Option<String>,
    #[serde(default)]
    pub graph_api_key: Option<String>,
    #[serde(default = "default_page_size_ceiling")]
    pub memory_page_size_ceiling: usize,
    #[serde(default = "default_true")]
    pub provision_memory_project: bool,

    // Turn pipeline
    #[serde(default)]
    pub affect_mode: AffectMode,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,

    // Reconstruction
    #[serde(default = "default_profile_categories")]
    pub profile_categories: Vec<String>,
    #[serde(default = "default_proactive_categories")]
    pub proactive_categories: Vec<String>,
    #[serde(default = "default_topic_categories")]
    pub topic_categories: Vec<String>,
    #[serde(default = "default_proactive_window_days")]
    pub proactive_window_days: i64,
    #[serde(default = "default_mood_window_days")]
    pub mood_window_days: i64,
    #[serde(default = "default_profile_page_size")]
    pub profile_page_size: usize,
    #[serde(default = "default_proactive_page_size")]
    pub proactive_page_size: usize,
    #[serde(default = "default_mood_page_size")]
    pub mood_page_size: usize,
    #[serde(default = "default_topic_page_size")]
    pub topic_page_size: usize,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_database_path() -> String {
    "confidant_memory.db".to_string()
}

fn default_page_size_ceiling() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_search_limit() -> usize {
    3
}

fn default_profile_categories() -> Vec<String> {
    [
        taxonomy::PERSONAL_DETAILS,
        taxonomy::USER_INTERESTS,
        taxonomy::USER_PREFERENCES,
        taxonomy::RELATIONSHIPS,
        taxonomy::OPINIONS,
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

fn default_proactive_categories() -> Vec<String> {
    [
        taxonomy::LIFE_EVENTS,
        taxonomy::DAILY_ROUTINE,
        taxonomy::RELATIONSHIPS,
        taxonomy::PROFESSIONAL_DETAILS,
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

fn default_topic_categories() -> Vec<String> {
    [
        taxonomy::USER_INTERESTS,
        taxonomy::FAVORITES,
        taxonomy::LEARNING,
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

fn default_proactive_window_days() -> i64 {
    10
}

fn default_mood_window_days() -> i64 {
    30
}

fn default_profile_page_size() -> usize {
    30
}

fn default_proactive_page_size() -> usize {
    15
}

fn default_mood_page_size() -> usize {
    50
}

fn default_topic_page_size() -> usize {
    20
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_temperature: default_temperature(),
            llm_max_tokens: default_max_tokens(),
            memory_backend: MemoryBackendKind::default(),
            database_path: default_database_path(),
            memory_api_url: None,
            memory_api_key: None,
            graph_api_url: None,
            graph_api_key: None,
            memory_page_size_ceiling: default_page_size_ceiling(),
            provision_memory_project: true,
            affect_mode: AffectMode::default(),
            search_limit: default_search_limit(),
            profile_categories: default_profile_categories(),
            proactive_categories: default_proactive_categories(),
            topic_categories: default_topic_categories(),
            proactive_window_days: default_proactive_window_days(),
            mood_window_days: default_mood_window_days(),
            profile_page_size: default_profile_page_size(),
            proactive_page_size: default_proactive_page_size(),
            mood_page_size: default_mood_page_size(),
            topic_page_size: default_topic_page_size(),
        }
    }
}

impl BackendConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("confidant_config.toml")
    }

    /// Load config from confidant_config.toml (next to executable), falling back to env vars.
    /// Environment overrides are applied on top of whichever source won.
    pub fn load() -> Self {
        let path = Self::config_path();

        let base = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<BackendConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::default()
            }
        };

        base.with_env_overrides()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults plus environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("CONFIDANT_LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("CONFIDANT_LLM_MODEL") {
            self.llm_model = model;
        }

        if let Some(key) = non_empty_env("CONFIDANT_LLM_API_KEY") {
            self.llm_api_key = Some(key);
        }

        if let Ok(kind) = env::var("CONFIDANT_MEMORY_BACKEND") {
            match kind.parse() {
                Ok(kind) => self.memory_backend = kind,
                Err(e) => tracing::error!("Ignoring CONFIDANT_MEMORY_BACKEND: {}", e),
            }
        }

        if let Some(path) = non_empty_env("CONFIDANT_DATABASE_PATH") {
            self.database_path = path;
        }

        if let Some(url) = non_empty_env("CONFIDANT_MEMORY_API_URL") {
            self.memory_api_url = Some(url);
        }

        if let Some(key) = non_empty_env("CONFIDANT_MEMORY_API_KEY") {
            self.memory_api_key = Some(key);
        }

        if let Some(url) = non_empty_env("CONFIDANT_GRAPH_API_URL") {
            self.graph_api_url = Some(url);
        }

        if let Some(key) = non_empty_env("CONFIDANT_GRAPH_API_KEY") {
            self.graph_api_key = Some(key);
        }

        if let Ok(mode) = env::var("CONFIDANT_AFFECT_MODE") {
            match mode.parse() {
                Ok(mode) => self.affect_mode = mode,
                Err(e) => tracing::error!("Ignoring CONFIDANT_AFFECT_MODE: {}", e),
            }
        }

        if let Some(limit) = parse_env::<usize>("CONFIDANT_SEARCH_LIMIT") {
            self.search_limit = limit;
        }

        self
    }

    /// Startup check for credentials and endpoints. Missing configuration is fatal,
    /// never a per-turn condition.
    pub fn validate(&self) -> Result<()> {
        if self.llm_api_url.trim().is_empty() {
            bail!("llm_api_url is required (set CONFIDANT_LLM_API_URL)");
        }
        if self.llm_model.trim().is_empty() {
            bail!("llm_model is required (set CONFIDANT_LLM_MODEL)");
        }
        if self.search_limit == 0 {
            bail!("search_limit must be at least 1");
        }
        if self.memory_page_size_ceiling == 0 {
            bail!("memory_page_size_ceiling must be at least 1");
        }

        match self.memory_backend {
            MemoryBackendKind::Local => {
                if self.database_path.trim().is_empty() {
                    bail!("database_path is required for the local memory backend");
                }
            }
            MemoryBackendKind::Remote => {
                if is_blank(&self.memory_api_url) {
                    bail!("memory_api_url is required for the remote memory backend (set CONFIDANT_MEMORY_API_URL)");
                }
                if is_blank(&self.memory_api_key) {
                    bail!("memory_api_key is required for the remote memory backend (set CONFIDANT_MEMORY_API_KEY)");
                }
                if is_blank(&self.graph_api_url) {
                    bail!("graph_api_url is required for the remote memory backend (set CONFIDANT_GRAPH_API_URL)");
                }
            }
        }

        for (name, categories) in [
            ("profile_categories", &self.profile_categories),
            ("proactive_categories", &self.proactive_categories),
            ("topic_categories", &self.topic_categories),
        ] {
            if categories.is_empty() {
                bail!("{} must name at least one memory category", name);
            }
        }

        for category in self
            .profile_categories
            .iter()
            .chain(&self.proactive_categories)
            .chain(&self.topic_categories)
        {
            if !taxonomy::is_known_category(category) {
                bail!("Unknown memory category '{}' in configuration", category);
            }
        }

        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}
