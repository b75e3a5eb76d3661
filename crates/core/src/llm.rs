//! Hosted chat model clients
//!
//! Two wire formats are supported:
//! - OpenAI-compatible `/chat/completions` (Groq hosts the orchestrator model)
//! - Google Generative Language `generateContent` (Gemini answers for the handlers)
//!
//! Both are blocking and retry rate limits and server errors a bounded number
//! of times; callers see a single `Result`.

use anyhow::{anyhow, Result};
use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("missing API key: set {0}")]
    MissingApiKey(&'static str),
    #[error("request failed: {0}")]
    Http(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to parse model response: {0}")]
    Parse(String),
    #[error("no text found in model response")]
    EmptyResponse,
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Provider-neutral chat request
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Optional system instructions
    pub system: Option<String>,
    /// Conversation, oldest first
    pub messages: Vec<ChatMessage>,
    /// Ask the provider for a bare JSON object
    pub json_mode: bool,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            messages: vec![ChatMessage::user(user)],
            json_mode: false,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// A hosted model that turns a chat request into text
pub trait ChatModel: Send + Sync {
    fn complete(&self, request: &ChatRequest) -> Result<String>;
}

/// Connection and sampling settings for a hosted model
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

fn build_client(timeout_secs: u64) -> Result<Client, LlmError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| LlmError::Http(e.to_string()))
}

/// Send a request, retrying 429/5xx and transport failures.
///
/// Returns the body of the first successful response.
pub(crate) fn send_with_retry<F>(
    max_retries: u32,
    backoff: Duration,
    mut send: F,
) -> Result<String, LlmError>
where
    F: FnMut() -> reqwest::Result<Response>,
{
    let mut attempt: u32 = 0;
    loop {
        match send() {
            Ok(response) => {
                let status = response.status();
                let body = response.text().map_err(|e| LlmError::Http(e.to_string()))?;
                if status.is_success() {
                    return Ok(body);
                }
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if !retryable || attempt >= max_retries {
                    return Err(LlmError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }
                warn!(status = %status, attempt, "retryable response from model API");
            }
            Err(e) => {
                if attempt >= max_retries {
                    return Err(LlmError::Http(e.to_string()));
                }
                warn!(error = %e, attempt, "model API request failed, retrying");
            }
        }
        attempt += 1;
        thread::sleep(backoff * attempt);
    }
}

// ============================================================================
// OpenAI-compatible chat completions
// ============================================================================

#[derive(Serialize)]
struct CompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct CompletionsResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize, Debug)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize, Debug)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint
pub struct OpenAiCompatModel {
    client: Client,
    settings: ModelSettings,
}

impl OpenAiCompatModel {
    pub fn new(settings: ModelSettings) -> Result<Self, LlmError> {
        Ok(Self {
            client: build_client(settings.timeout_secs)?,
            settings,
        })
    }

    fn call(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey("GROQ_API_KEY"))?;

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref system) = request.system {
            messages.push(ChatMessage {
                role: ChatRole::System,
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().cloned());

        let body = CompletionsRequest {
            model: &self.settings.model,
            messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            top_p: self.settings.top_p,
            response_format: request
                .json_mode
                .then(|| serde_json::json!({ "type": "json_object" })),
        };

        let url = format!(
            "{}/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );
        debug!(url = %url, model = %self.settings.model, "calling chat completions");

        let text = send_with_retry(
            self.settings.max_retries,
            Duration::from_millis(self.settings.retry_backoff_ms),
            || self.client.post(&url).bearer_auth(api_key).json(&body).send(),
        )?;

        let parsed: CompletionsResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::Parse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

impl ChatModel for OpenAiCompatModel {
    fn complete(&self, request: &ChatRequest) -> Result<String> {
        Ok(self.call(request)?)
    }
}

// ============================================================================
// Gemini generateContent
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize, Debug)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Serialize, Deserialize, Debug)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<GeminiContent>,
}

fn text_content(role: Option<&str>, text: &str) -> GeminiContent {
    GeminiContent {
        role: role.map(str::to_string),
        parts: vec![GeminiPart {
            text: Some(text.to_string()),
        }],
    }
}

/// Client for Gemini models on the Generative Language API
pub struct GeminiModel {
    client: Client,
    settings: ModelSettings,
}

impl GeminiModel {
    pub fn new(settings: ModelSettings) -> Result<Self, LlmError> {
        Ok(Self {
            client: build_client(settings.timeout_secs)?,
            settings,
        })
    }

    fn call(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey("GOOGLE_API_KEY"))?;

        let contents = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    ChatRole::Assistant => "model",
                    _ => "user",
                };
                text_content(Some(role), &m.content)
            })
            .collect();

        let body = GenerateRequest {
            system_instruction: request.system.as_deref().map(|s| text_content(None, s)),
            contents,
            generation_config: GenerationConfig {
                temperature: self.settings.temperature,
                max_output_tokens: self.settings.max_tokens,
                top_p: self.settings.top_p,
                response_mime_type: request.json_mode.then_some("application/json"),
            },
        };

        let url = format!(
            "{}/models/{}:generateContent",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.model
        );
        debug!(url = %url, "calling Gemini generateContent");

        let text = send_with_retry(
            self.settings.max_retries,
            Duration::from_millis(self.settings.retry_backoff_ms),
            || {
                self.client
                    .post(&url)
                    .header("x-goog-api-key", api_key)
                    .json(&body)
                    .send()
            },
        )?;

        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::Parse(e.to_string()))?;

        let chunks: Vec<String> = parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect();

        if chunks.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(chunks.join("").trim().to_string())
    }
}

impl ChatModel for GeminiModel {
    fn complete(&self, request: &ChatRequest) -> Result<String> {
        Ok(self.call(request)?)
    }
}

// ============================================================================
// JSON extraction from model text
// ============================================================================

/// Locate the first balanced JSON object in free-form model output
pub fn extract_json_object(text: &str) -> Result<&str> {
    let s = text.trim();

    let start = s.find('{').ok_or_else(|| anyhow!("No '{{' found in model output"))?;

    let mut in_str = false;
    let mut escape = false;
    let mut depth = 0;

    for (i, ch) in s[start..].char_indices() {
        if in_str {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_str = false;
            }
            continue;
        }

        match ch {
            '"' => in_str = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }

    Err(anyhow!("No matching '}}' found in model output"))
}

/// Parse model output as JSON, tolerating surrounding prose or code fences
pub fn parse_json_from_text<T: DeserializeOwned>(text: &str) -> Result<T> {
    let s = text.trim();

    // Fast path: the whole output is the object
    if s.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str(s) {
            return Ok(parsed);
        }
    }

    let json_str = extract_json_object(s)?;
    serde_json::from_str(json_str).map_err(|e| anyhow!("Failed to parse JSON: {}", e))
}

// ============================================================================
// Tests
// ============================================================================
