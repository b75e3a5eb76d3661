//! Wiring: builds the clients, handlers and dispatcher from configuration

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chunker::SemanticChunker;
use crate::config::{Credentials, RouterConfig};
use crate::embed::GeminiEmbedder;
use crate::knowledge::PdfKnowledgeBase;
use crate::llm::{GeminiModel, OpenAiCompatModel};
use crate::orchestrator::Orchestrator;
use crate::qdrant::QdrantClient;
use crate::rag::RagAgent;
use crate::session::SessionStore;
use crate::sql::Text2SqlAgent;

/// Everything the pages need
pub struct AgentSystem {
    pub knowledge: Arc<PdfKnowledgeBase>,
    pub rag: Arc<RagAgent>,
    pub orchestrator: Orchestrator,
}

pub fn build_knowledge_base(config: &RouterConfig, creds: &Credentials) -> Result<PdfKnowledgeBase> {
    let rag = &config.rag;
    let embedder = GeminiEmbedder::new(rag.embedder_settings(creds))
        .context("Failed to create embedder")?;
    let vector_db = QdrantClient::new(&creds.qdrant_url, creds.qdrant_api_key.clone(), rag.timeout_secs)
        .context("Failed to create Qdrant client")?;

    let chunker = SemanticChunker {
        breakpoint_percentile: rag.breakpoint_percentile,
        ..SemanticChunker::default()
    };

    Ok(PdfKnowledgeBase::new(
        rag.resolved_pdf_path(),
        rag.collection.clone(),
        Arc::new(embedder),
        vector_db,
    )
    .with_chunker(chunker)
    .with_score_threshold(rag.score_threshold))
}

/// Retrieval handler; session persistence is skipped if the store cannot open
pub fn build_rag_agent(
    config: &RouterConfig,
    creds: &Credentials,
    knowledge: Arc<PdfKnowledgeBase>,
    session_id: &str,
) -> Result<RagAgent> {
    let rag = &config.rag;
    let model = GeminiModel::new(rag.model_settings(creds)).context("Failed to create RAG model")?;

    let mut agent = RagAgent::new(knowledge, Arc::new(model))
        .with_top_k(rag.top_k)
        .with_history_turns(rag.history_turns)
        .with_prompt_file(&rag.prompt_file)
        .with_session_id(session_id);

    let session_db = rag.resolved_session_db();
    match SessionStore::open(&session_db) {
        Ok(store) => {
            debug!(path = %session_db.display(), "Session store opened");
            agent = agent.with_sessions(store);
        }
        Err(e) => warn!(error = %e, "Session store unavailable, history disabled"),
    }
    Ok(agent)
}

pub fn build_sql_agent(config: &RouterConfig, creds: &Credentials) -> Result<Text2SqlAgent> {
    let sql = &config.sql;
    let model = GeminiModel::new(sql.model_settings(creds)).context("Failed to create SQL model")?;
    Ok(Text2SqlAgent::new(sql.resolved_db_path(), Arc::new(model))
        .with_max_rows(sql.max_rows)
        .with_prompt_file(&sql.prompt_file))
}

impl AgentSystem {
    pub fn build(config: &RouterConfig, creds: &Credentials, session_id: &str) -> Result<Self> {
        let knowledge = Arc::new(build_knowledge_base(config, creds)?);
        let rag = Arc::new(build_rag_agent(config, creds, knowledge.clone(), session_id)?);
        let sql = Arc::new(build_sql_agent(config, creds)?);

        let orch = &config.orchestrator;
        let model = OpenAiCompatModel::new(orch.model_settings(creds))
            .context("Failed to create orchestrator model")?;

        let orchestrator = Orchestrator::new(Arc::new(model))
            .with_history_limit(orch.history_limit)
            .with_prompt_file(&orch.prompt_file)
            .with_handler(sql)
            .with_handler(rag.clone());

        Ok(Self {
            knowledge,
            rag,
            orchestrator,
        })
    }
}
