//! Hosted embedding client (Gemini `embedding-001`)

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::llm::{send_with_retry, LlmError};

/// Gemini caps batchEmbedContents at 100 requests
const MAX_BATCH: usize = 100;

/// Output size of `models/embedding-001`
pub const GEMINI_EMBEDDING_DIM: usize = 768;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error(transparent)]
    Transport(#[from] LlmError),
    #[error("failed to parse embedding response: {0}")]
    Parse(String),
    #[error("expected {expected} embeddings, got {got}")]
    CountMismatch { expected: usize, got: usize },
}

/// Embedding vector
pub type Embedding = Vec<f32>;

/// Turns text into vectors for indexing and search
pub trait Embedder: Send + Sync {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbedError>;
    fn embed_query(&self, text: &str) -> Result<Embedding, EmbedError>;
    fn dimension(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct EmbedderSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest<'a> {
    model: &'a str,
    content: Content<'a>,
    task_type: &'static str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    requests: Vec<EmbedRequest<'a>>,
}

#[derive(Deserialize)]
struct Values {
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct SingleResponse {
    embedding: Values,
}

#[derive(Deserialize)]
struct BatchResponse {
    #[serde(default)]
    embeddings: Vec<Values>,
}

pub struct GeminiEmbedder {
    client: Client,
    settings: EmbedderSettings,
    model_path: String,
}

impl GeminiEmbedder {
    pub fn new(settings: EmbedderSettings) -> Result<Self, EmbedError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| LlmError::Http(e.to_string()))?;

        let model_path = if settings.model.starts_with("models/") {
            settings.model.clone()
        } else {
            format!("models/{}", settings.model)
        };

        Ok(Self {
            client,
            settings,
            model_path,
        })
    }

    fn request<'a>(&'a self, text: &'a str, task_type: &'static str) -> EmbedRequest<'a> {
        EmbedRequest {
            model: &self.model_path,
            content: Content {
                parts: [Part { text }],
            },
            task_type,
        }
    }

    fn post<B: Serialize>(&self, method: &str, body: &B) -> Result<String, EmbedError> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey("GOOGLE_API_KEY"))?;

        let url = format!(
            "{}/{}:{}",
            self.settings.base_url.trim_end_matches('/'),
            self.model_path,
            method
        );

        Ok(send_with_retry(
            self.settings.max_retries,
            Duration::from_millis(500),
            || {
                self.client
                    .post(&url)
                    .header("x-goog-api-key", api_key)
                    .json(body)
                    .send()
            },
        )?)
    }
}

impl Embedder for GeminiEmbedder {
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbedError> {
        let mut out = Vec::with_capacity(texts.len());

        for batch in texts.chunks(MAX_BATCH) {
            debug!(count = batch.len(), "embedding document batch");
            let body = BatchRequest {
                requests: batch
                    .iter()
                    .map(|t| self.request(t, "RETRIEVAL_DOCUMENT"))
                    .collect(),
            };
            let text = self.post("batchEmbedContents", &body)?;
            let parsed: BatchResponse =
                serde_json::from_str(&text).map_err(|e| EmbedError::Parse(e.to_string()))?;

            if parsed.embeddings.len() != batch.len() {
                return Err(EmbedError::CountMismatch {
                    expected: batch.len(),
                    got: parsed.embeddings.len(),
                });
            }
            out.extend(parsed.embeddings.into_iter().map(|v| v.values));
        }

        Ok(out)
    }

    fn embed_query(&self, text: &str) -> Result<Embedding, EmbedError> {
        let body = self.request(text, "RETRIEVAL_QUERY");
        let text = self.post("embedContent", &body)?;
        let parsed: SingleResponse =
            serde_json::from_str(&text).map_err(|e| EmbedError::Parse(e.to_string()))?;
        Ok(parsed.embedding.values)
    }

    fn dimension(&self) -> usize {
        GEMINI_EMBEDDING_DIM
    }
}

/// Cosine similarity; 0.0 when either vector is all zeros
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
