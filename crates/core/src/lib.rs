//! Agent Router Core Library
//!
//! Routes natural-language queries to one of two handlers:
//! - A text-to-SQL handler over a stock database
//! - A retrieval handler over a PDF indexed in Qdrant
//!
//! The routing decision is made by a hosted model; the dispatcher runs the
//! selected handlers and reports everything through a JSON envelope.

pub mod types;

pub mod app;
pub mod chunker;
pub mod config;
pub mod display;
pub mod embed;
pub mod knowledge;
pub mod llm;
pub mod orchestrator;
pub mod qdrant;
pub mod rag;
pub mod session;
pub mod sql;

// Re-export commonly used types at crate root
pub use types::{
    truncate_history, AgentKind, ChatTurn, DateRange, Envelope, EnvelopeData, Status, TurnRole,
    MAX_HISTORY_TURNS,
};

pub use app::AgentSystem;
pub use config::{Credentials, RouterConfig};
pub use display::{parse_sql_response, render_envelope, Rendered, SqlAnswer};
pub use orchestrator::{Orchestrator, QueryHandler};
