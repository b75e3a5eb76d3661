//! Domain models shared by the dispatcher, the handlers and the pages
//!
//! This module contains the core types used throughout the router, including:
//! - The response envelope (status, message, data)
//! - Handler names as the model spells them
//! - Chat history turns and the history truncation policy

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Most recent turns forwarded to the orchestrator model
pub const MAX_HISTORY_TURNS: usize = 5;

/// Timestamp layout used for chat turns
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ============================================================================
// Handlers
// ============================================================================

/// The two handlers the dispatcher can delegate to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AgentKind {
    #[serde(rename = "text2sql_agent")]
    Text2Sql,
    #[serde(rename = "rag_agent")]
    Rag,
}

impl AgentKind {
    /// Name used in prompts, sub-query maps and envelopes
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Text2Sql => "text2sql_agent",
            AgentKind::Rag => "rag_agent",
        }
    }

    /// Parse a handler name as emitted by the model (lenient on case/spacing)
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "text2sql_agent" | "text2sql" | "sql_agent" => Some(AgentKind::Text2Sql),
            "rag_agent" | "rag" => Some(AgentKind::Rag),
            _ => None,
        }
    }

    /// Text substituted when the handler produced nothing
    pub fn empty_result(&self) -> &'static str {
        match self {
            AgentKind::Text2Sql => "No data retrieved from SQL.",
            AgentKind::Rag => "No information retrieved from RAG.",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Inclusive date range extracted by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start_date: String,
    pub end_date: String,
}

/// Payload of the envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeData {
    #[serde(default)]
    pub agents: Vec<AgentKind>,

    #[serde(default)]
    pub sub_queries: BTreeMap<AgentKind, String>,

    #[serde(default)]
    pub tickers: Vec<String>,

    #[serde(default)]
    pub date_range: Option<DateRange>,

    /// Combined handler output; absent when no handler ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Output of each handler that ran, keyed by handler
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub results: BTreeMap<AgentKind, String>,
}

/// The JSON envelope returned for every query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: Status,
    pub message: String,
    #[serde(default)]
    pub data: EnvelopeData,
}

impl Envelope {
    pub fn success(message: impl Into<String>, data: EnvelopeData) -> Self {
        Self {
            status: Status::Success,
            message: message.into(),
            data,
        }
    }

    /// Error envelope: no agents, no sub-queries, no entities
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            data: EnvelopeData::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

// ============================================================================
// Chat History
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TurnRole::User),
            "assistant" => Some(TurnRole::Assistant),
            _ => None,
        }
    }
}

/// A single prior interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::now(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::now(TurnRole::Assistant, content)
    }

    fn now(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_timestamp(),
        }
    }
}

/// Current local time in the chat turn layout
pub fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Keep only the most recent `limit` turns, oldest first
pub fn truncate_history(history: &[ChatTurn], limit: usize) -> &[ChatTurn] {
    let start = history.len().saturating_sub(limit);
    &history[start..]
}

// ============================================================================
// Tests
// ============================================================================
