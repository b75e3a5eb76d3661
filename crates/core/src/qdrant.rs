//! Qdrant HTTP Client
//!
//! Thin blocking client for the handful of Qdrant REST calls the knowledge
//! base needs: collection lifecycle, point upsert and similarity search.

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Points per upsert request
const UPSERT_BATCH: usize = 64;

#[derive(Error, Debug)]
pub enum QdrantError {
    #[error("Qdrant HTTP error: {0}")]
    Http(String),
    #[error("Qdrant returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

impl From<reqwest::Error> for QdrantError {
    fn from(e: reqwest::Error) -> Self {
        QdrantError::Http(e.to_string())
    }
}

/// A vector with its payload, ready to upsert
#[derive(Debug, Clone, Serialize)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A search hit
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredPoint {
    pub id: Value,
    pub score: f32,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Clone)]
pub struct QdrantClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout_secs: u64) -> Result<Self, QdrantError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn with_key(&self, request: RequestBuilder) -> RequestBuilder {
        match self.api_key {
            Some(ref key) => request.header("api-key", key),
            None => request,
        }
    }

    fn collection_url(&self, name: &str) -> String {
        format!("{}/collections/{}", self.base_url, name)
    }

    pub fn collection_exists(&self, name: &str) -> Result<bool, QdrantError> {
        let resp = self.with_key(self.http.get(self.collection_url(name))).send()?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(QdrantError::Status {
                status: s.as_u16(),
                body: resp.text().unwrap_or_default(),
            }),
        }
    }

    /// Delete a collection; a missing collection is not an error
    pub fn delete_collection(&self, name: &str) -> Result<(), QdrantError> {
        let resp = self.with_key(self.http.delete(self.collection_url(name))).send()?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND {
            warn!(name = %name, "Collection already deleted (404)");
            Ok(())
        } else if status.is_success() {
            info!(name = %name, "Deleted collection");
            Ok(())
        } else {
            Err(QdrantError::Status {
                status: status.as_u16(),
                body: resp.text().unwrap_or_default(),
            })
        }
    }

    /// Create a collection using cosine distance
    pub fn create_collection(&self, name: &str, dimension: usize) -> Result<(), QdrantError> {
        if dimension == 0 {
            return Err(QdrantError::InvalidInput("dimension must be > 0".to_string()));
        }
        let body = json!({
            "vectors": { "size": dimension, "distance": "Cosine" }
        });
        let resp = self
            .with_key(self.http.put(self.collection_url(name)))
            .json(&body)
            .send()?;

        let status = resp.status();
        if !status.is_success() {
            return Err(QdrantError::Status {
                status: status.as_u16(),
                body: resp.text().unwrap_or_default(),
            });
        }
        info!(name = %name, dimension, "Created collection");
        Ok(())
    }

    /// Upsert points in batches, waiting for each batch to be applied
    pub fn upsert(&self, name: &str, points: &[Point]) -> Result<(), QdrantError> {
        if points.is_empty() {
            return Err(QdrantError::InvalidInput("points cannot be empty".to_string()));
        }

        for batch in points.chunks(UPSERT_BATCH) {
            let resp = self
                .with_key(
                    self.http
                        .put(format!("{}/points?wait=true", self.collection_url(name))),
                )
                .json(&json!({ "points": batch }))
                .send()?;

            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Err(QdrantError::CollectionNotFound(name.to_string()));
            }
            if !status.is_success() {
                return Err(QdrantError::Status {
                    status: status.as_u16(),
                    body: resp.text().unwrap_or_default(),
                });
            }
            debug!(name = %name, count = batch.len(), "Upserted points");
        }
        Ok(())
    }

    /// Nearest neighbours of `vector`, best first
    pub fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>, QdrantError> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(threshold) = score_threshold {
            body["score_threshold"] = json!(threshold);
        }

        let resp = self
            .with_key(
                self.http
                    .post(format!("{}/points/search", self.collection_url(name))),
            )
            .json(&body)
            .send()?;

        let status = resp.status();
        let text = resp.text()?;

        if status == StatusCode::NOT_FOUND {
            return Err(QdrantError::CollectionNotFound(name.to_string()));
        }
        if !status.is_success() {
            return Err(QdrantError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: SearchResponse = serde_json::from_str(&text)
            .map_err(|e| QdrantError::Deserialize(format!("{}: {}", e, text)))?;
        debug!(name = %name, hits = parsed.result.len(), "Search complete");
        Ok(parsed.result)
    }
}
