//! PDF knowledge base backed by Qdrant
//!
//! Loading extracts text per page, splits it semantically, embeds each chunk
//! and upserts the vectors. Searching embeds the question and returns the
//! nearest passages ("KB hits").

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunker::SemanticChunker;
use crate::embed::Embedder;
use crate::qdrant::{Point, QdrantClient};

/// A retrieved passage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KbHit {
    pub content: String,
    pub score: f32,
    pub page: Option<u32>,
    pub chunk: Option<u32>,
}

/// Anything that can return passages for a question
pub trait Retriever: Send + Sync {
    fn search(&self, query: &str, limit: usize) -> Result<Vec<KbHit>>;
}

pub struct PdfKnowledgeBase {
    path: PathBuf,
    collection: String,
    embedder: Arc<dyn Embedder>,
    vector_db: QdrantClient,
    chunker: SemanticChunker,
    score_threshold: Option<f32>,
}

impl PdfKnowledgeBase {
    pub fn new(
        path: PathBuf,
        collection: impl Into<String>,
        embedder: Arc<dyn Embedder>,
        vector_db: QdrantClient,
    ) -> Self {
        Self {
            path,
            collection: collection.into(),
            embedder,
            vector_db,
            chunker: SemanticChunker::default(),
            score_threshold: None,
        }
    }

    pub fn with_chunker(mut self, chunker: SemanticChunker) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_score_threshold(mut self, threshold: Option<f32>) -> Self {
        self.score_threshold = threshold;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Index the PDF. Skips work when the collection exists and `recreate`
    /// is false. Returns the number of chunks written.
    pub fn load(&self, recreate: bool) -> Result<usize> {
        if !recreate && self.vector_db.collection_exists(&self.collection)? {
            info!(collection = %self.collection, "Knowledge base already loaded");
            return Ok(0);
        }
        let pages = read_pdf_pages(&self.path)?;
        self.load_pages(&pages)
    }

    /// Replace the collection with chunks of `pages` (page 1 first)
    fn load_pages(&self, pages: &[String]) -> Result<usize> {
        let points = self.build_points(pages)?;
        if points.is_empty() {
            bail!("No text extracted from {}", self.path.display());
        }

        self.vector_db.delete_collection(&self.collection)?;
        self.vector_db
            .create_collection(&self.collection, points[0].vector.len())?;
        if let Err(e) = self.vector_db.upsert(&self.collection, &points) {
            // A partial collection would pass the exists check on the next load
            if let Err(cleanup) = self.vector_db.delete_collection(&self.collection) {
                warn!(collection = %self.collection, error = %cleanup, "Failed to drop partial collection");
            }
            return Err(e.into());
        }

        info!(
            collection = %self.collection,
            chunks = points.len(),
            pages = pages.len(),
            "Knowledge base loaded"
        );
        Ok(points.len())
    }

    fn build_points(&self, pages: &[String]) -> Result<Vec<Point>> {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string());

        let mut chunks: Vec<(u32, String)> = Vec::new();
        for (i, page) in pages.iter().enumerate() {
            for chunk in self.chunker.split(page, self.embedder.as_ref())? {
                chunks.push((i as u32 + 1, chunk));
            }
        }
        debug!(chunks = chunks.len(), "Chunked document");

        let texts: Vec<String> = chunks.iter().map(|(_, c)| c.clone()).collect();
        let vectors = self.embedder.embed_documents(&texts)?;

        Ok(chunks
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(idx, ((page, content), vector))| Point {
                id: point_id(&name, idx).to_string(),
                vector,
                payload: json!({
                    "content": content,
                    "name": name,
                    "page": page,
                    "chunk": idx,
                }),
            })
            .collect())
    }
}

impl Retriever for PdfKnowledgeBase {
    fn search(&self, query: &str, limit: usize) -> Result<Vec<KbHit>> {
        let vector = self.embedder.embed_query(query)?;
        let hits = self
            .vector_db
            .search(&self.collection, &vector, limit, self.score_threshold)?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let payload = hit.payload?;
                let content = payload.get("content")?.as_str()?.to_string();
                Some(KbHit {
                    content,
                    score: hit.score,
                    page: payload.get("page").and_then(|v| v.as_u64()).map(|v| v as u32),
                    chunk: payload.get("chunk").and_then(|v| v.as_u64()).map(|v| v as u32),
                })
            })
            .collect())
    }
}

/// Stable id for chunk `idx` of document `name`
fn point_id(name: &str, idx: usize) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}:{}", name, idx).as_bytes())
}

/// Extract text per page; pdf-extract can panic on malformed fonts
pub fn read_pdf_pages(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        bail!("PDF not found: {}", path.display());
    }
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pdf_extract::extract_text_by_pages(path)
    }));

    match result {
        Ok(pages) => pages
            .map_err(|e| anyhow!("Failed to extract text from {}: {}", path.display(), e)),
        Err(_) => Err(anyhow!("PDF extraction panicked for {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::{EmbedError, Embedding};

    struct LengthEmbedder;

    impl Embedder for LengthEmbedder {
        fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbedError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn embed_query(&self, _text: &str) -> Result<Embedding, EmbedError> {
            Ok(vec![0.5, 0.5])
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn kb(url: &str) -> PdfKnowledgeBase {
        PdfKnowledgeBase::new(
            PathBuf::from("data/report.pdf"),
            "rag_collection",
            Arc::new(LengthEmbedder),
            QdrantClient::new(url, None, 5).unwrap(),
        )
    }

    #[test]
    fn test_point_ids_stable() {
        assert_eq!(point_id("report.pdf", 3), point_id("report.pdf", 3));
        assert_ne!(point_id("report.pdf", 3), point_id("report.pdf", 4));
    }

    #[test]
    fn test_build_points_tracks_pages() {
        let kb = kb("http://127.0.0.1:9");
        let pages = vec![
            "GPT-4 is a multimodal model.".to_string(),
            String::new(),
            "RLHF was applied after pretraining.".to_string(),
        ];
        let points = kb.build_points(&pages).unwrap();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].payload["page"], 1);
        assert_eq!(points[1].payload["page"], 3);
        assert_eq!(points[1].payload["chunk"], 1);
        assert_eq!(points[0].payload["name"], "report.pdf");
    }

    #[test]
    fn test_load_pages_recreates_collection() {
        let mut server = mockito::Server::new();
        let delete = server
            .mock("DELETE", "/collections/rag_collection")
            .with_status(200)
            .create();
        let create = server
            .mock("PUT", "/collections/rag_collection")
            .match_body(mockito::Matcher::PartialJson(json!({
                "vectors": { "size": 2 }
            })))
            .with_status(200)
            .create();
        let upsert = server
            .mock(
                "PUT",
                mockito::Matcher::Regex(r"^/collections/rag_collection/points(\?.*)?$".to_string()),
            )
            .with_status(200)
            .create();

        let n = kb(&server.url())
            .load_pages(&["Alignment used RLHF.".to_string()])
            .unwrap();

        assert_eq!(n, 1);
        delete.assert();
        create.assert();
        upsert.assert();
    }

    #[test]
    fn test_failed_upsert_drops_collection() {
        let mut server = mockito::Server::new();
        let delete = server
            .mock("DELETE", "/collections/rag_collection")
            .with_status(200)
            .expect(2)
            .create();
        let _create = server
            .mock("PUT", "/collections/rag_collection")
            .with_status(200)
            .create();
        let upsert = server
            .mock(
                "PUT",
                mockito::Matcher::Regex(r"^/collections/rag_collection/points(\?.*)?$".to_string()),
            )
            .with_status(500)
            .with_body("storage error")
            .create();

        let err = kb(&server.url())
            .load_pages(&["Alignment used RLHF.".to_string()])
            .unwrap_err();

        assert!(err.to_string().contains("500"));
        upsert.assert();
        // Once before creating, once after the failed upsert
        delete.assert();
    }

    #[test]
    fn test_load_pages_empty_document() {
        let err = kb("http://127.0.0.1:9").load_pages(&["   ".to_string()]).unwrap_err();
        assert!(err.to_string().contains("No text extracted"));
    }

    #[test]
    fn test_load_skips_existing_collection() {
        let mut server = mockito::Server::new();
        let exists = server
            .mock("GET", "/collections/rag_collection")
            .with_status(200)
            .with_body(r#"{"result": {}}"#)
            .create();

        // The PDF path does not exist; reaching it would fail
        assert_eq!(kb(&server.url()).load(false).unwrap(), 0);
        exists.assert();
    }

    #[test]
    fn test_search_maps_payload() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("POST", "/collections/rag_collection/points/search")
            .with_status(200)
            .with_body(
                r#"{"result": [
                    {"id": "x", "score": 0.8, "payload": {"content": "RLHF", "page": 12, "chunk": 40}},
                    {"id": "y", "score": 0.7, "payload": {"name": "no content"}}
                ]}"#,
            )
            .create();

        let hits = kb(&server.url()).search("what is rlhf", 5).unwrap();
        assert_eq!(
            hits,
            vec![KbHit {
                content: "RLHF".to_string(),
                score: 0.8,
                page: Some(12),
                chunk: Some(40),
            }]
        );
    }

    #[test]
    fn test_read_missing_pdf() {
        let err = read_pdf_pages(Path::new("/nonexistent/file.pdf")).unwrap_err();
        assert!(err.to_string().contains("PDF not found"));
    }
}
