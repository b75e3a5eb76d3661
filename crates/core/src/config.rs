//! Runtime configuration
//!
//! Tunables come from `router_config.toml` in the working directory (every
//! field has a default); secrets and service endpoints come from the
//! environment, optionally seeded from a `.env` file by the binary.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::embed::EmbedderSettings;
use crate::llm::ModelSettings;
use crate::types::MAX_HISTORY_TURNS;

pub const CONFIG_FILE: &str = "router_config.toml";

/// Directory name within the platform data dir
const DATA_SUBDIR: &str = "agent-router";

const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_QDRANT_URL: &str = "http://localhost:6333";

// ============================================================================
// File configuration
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub sql: SqlConfig,
}

/// Intent classification model (Groq-hosted, OpenAI-compatible)
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_groq_base_url")]
    pub base_url: String,
    #[serde(default = "default_orchestrator_model")]
    pub model: String,
    #[serde(default = "default_orchestrator_temperature")]
    pub temperature: f32,
    #[serde(default = "default_orchestrator_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_orchestrator_prompt")]
    pub prompt_file: PathBuf,
}

fn default_groq_base_url() -> String { GROQ_BASE_URL.to_string() }
fn default_orchestrator_model() -> String { "llama-3.3-70b-versatile".to_string() }
fn default_orchestrator_temperature() -> f32 { 0.2 }
fn default_orchestrator_max_tokens() -> u32 { 1000 }
fn default_top_p() -> f32 { 0.8 }
fn default_timeout_secs() -> u64 { 30 }
fn default_max_retries() -> u32 { 5 }
fn default_history_limit() -> usize { MAX_HISTORY_TURNS }
fn default_orchestrator_prompt() -> PathBuf { PathBuf::from("prompts/orchestrator.md") }

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_url: default_groq_base_url(),
            model: default_orchestrator_model(),
            temperature: default_orchestrator_temperature(),
            max_tokens: default_orchestrator_max_tokens(),
            top_p: default_top_p(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            history_limit: default_history_limit(),
            prompt_file: default_orchestrator_prompt(),
        }
    }
}

/// Document-retrieval handler: Gemini answers over a Qdrant-indexed PDF
#[derive(Debug, Clone, Deserialize)]
pub struct RagConfig {
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Overridden by RAG_PDF_PATH
    #[serde(default)]
    pub pdf_path: Option<PathBuf>,
    /// Overridden by RAG_SESSION_DB
    #[serde(default)]
    pub session_db: Option<PathBuf>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub score_threshold: Option<f32>,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_rag_temperature")]
    pub temperature: f32,
    #[serde(default = "default_answer_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_breakpoint_percentile")]
    pub breakpoint_percentile: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_rag_prompt")]
    pub prompt_file: PathBuf,
}

fn default_gemini_base_url() -> String { GEMINI_BASE_URL.to_string() }
fn default_gemini_model() -> String { "gemini-1.5-flash".to_string() }
fn default_embedding_model() -> String { "models/embedding-001".to_string() }
fn default_collection() -> String { "rag_collection".to_string() }
fn default_top_k() -> usize { 5 }
fn default_history_turns() -> usize { 6 }
fn default_rag_temperature() -> f32 { 0.3 }
fn default_answer_max_tokens() -> u32 { 2048 }
fn default_breakpoint_percentile() -> f32 { 95.0 }
fn default_rag_prompt() -> PathBuf { PathBuf::from("prompts/rag_agent.md") }

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            base_url: default_gemini_base_url(),
            model: default_gemini_model(),
            embedding_model: default_embedding_model(),
            collection: default_collection(),
            pdf_path: None,
            session_db: None,
            top_k: default_top_k(),
            score_threshold: None,
            history_turns: default_history_turns(),
            temperature: default_rag_temperature(),
            max_tokens: default_answer_max_tokens(),
            breakpoint_percentile: default_breakpoint_percentile(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            prompt_file: default_rag_prompt(),
        }
    }
}

/// Structured-data handler: text-to-SQL over the stock database
#[derive(Debug, Clone, Deserialize)]
pub struct SqlConfig {
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    /// Overridden by STOCK_DB_PATH
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_answer_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_sql_prompt")]
    pub prompt_file: PathBuf,
}

fn default_max_rows() -> usize { 50 }
fn default_sql_prompt() -> PathBuf { PathBuf::from("prompts/text2sql.md") }

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            base_url: default_gemini_base_url(),
            model: default_gemini_model(),
            db_path: None,
            max_rows: default_max_rows(),
            temperature: 0.0,
            max_tokens: default_answer_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            prompt_file: default_sql_prompt(),
        }
    }
}

impl RouterConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse router config")
    }

    /// Load from `path` (or `router_config.toml` in the working directory).
    /// A missing or malformed file yields defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => env::current_dir()
                .map(|p| p.join(CONFIG_FILE))
                .unwrap_or_else(|_| PathBuf::from(CONFIG_FILE)),
        };

        if !config_path.exists() {
            debug!(path = %config_path.display(), "No config file, using defaults");
            return Self::default();
        }

        match fs::read_to_string(&config_path)
            .map_err(anyhow::Error::from)
            .and_then(|content| Self::from_toml_str(&content))
        {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }
}

// ============================================================================
// Environment
// ============================================================================

/// API keys and endpoints read from the environment
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub groq_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            groq_api_key: non_empty_env("GROQ_API_KEY"),
            google_api_key: non_empty_env("GOOGLE_API_KEY"),
            qdrant_url: non_empty_env("QDRANT_URL").unwrap_or_else(|| DEFAULT_QDRANT_URL.to_string()),
            qdrant_api_key: non_empty_env("QDRANT_API_KEY"),
        }
    }
}

/// Platform data directory for default database and document paths
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_SUBDIR)
}

fn resolve_path(env_name: &str, configured: Option<&PathBuf>, default_file: &str) -> PathBuf {
    non_empty_env(env_name)
        .map(PathBuf::from)
        .or_else(|| configured.cloned())
        .unwrap_or_else(|| data_dir().join(default_file))
}

impl OrchestratorConfig {
    pub fn model_settings(&self, creds: &Credentials) -> ModelSettings {
        ModelSettings {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key: creds.groq_api_key.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: Some(self.top_p),
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
            retry_backoff_ms: 500,
        }
    }
}

impl RagConfig {
    pub fn model_settings(&self, creds: &Credentials) -> ModelSettings {
        ModelSettings {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key: creds.google_api_key.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: None,
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
            retry_backoff_ms: 500,
        }
    }

    pub fn embedder_settings(&self, creds: &Credentials) -> EmbedderSettings {
        EmbedderSettings {
            base_url: self.base_url.clone(),
            model: self.embedding_model.clone(),
            api_key: creds.google_api_key.clone(),
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
        }
    }

    pub fn resolved_pdf_path(&self) -> PathBuf {
        resolve_path("RAG_PDF_PATH", self.pdf_path.as_ref(), "2303.08774v6.pdf")
    }

    pub fn resolved_session_db(&self) -> PathBuf {
        resolve_path("RAG_SESSION_DB", self.session_db.as_ref(), "rag_agent.db")
    }
}

impl SqlConfig {
    pub fn model_settings(&self, creds: &Credentials) -> ModelSettings {
        ModelSettings {
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            api_key: creds.google_api_key.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: None,
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
            retry_backoff_ms: 500,
        }
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        resolve_path("STOCK_DB_PATH", self.db_path.as_ref(), "stocks.db")
    }
}

// ============================================================================
// Prompt files
// ============================================================================

/// Read a prompt override from `path`, falling back to the embedded text
pub fn load_prompt(path: &Path, fallback: &str) -> String {
    if !path.exists() {
        debug!(path = %path.display(), "Prompt file not found, using fallback");
        return fallback.to_string();
    }
    match fs::read_to_string(path) {
        Ok(content) => {
            debug!(path = %path.display(), "Loaded prompt");
            content
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read prompt, using fallback");
            fallback.to_string()
        }
    }
}
