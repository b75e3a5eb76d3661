//! Query Dispatcher
//!
//! Asks the orchestrator model which handler(s) apply to a query, then runs
//! them and folds their answers into the response envelope. Every outcome,
//! including failures, is reported as an [`Envelope`].

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::load_prompt;
use crate::llm::{parse_json_from_text, ChatModel, ChatRequest};
use crate::types::{
    truncate_history, AgentKind, ChatTurn, DateRange, Envelope, EnvelopeData, Status,
    MAX_HISTORY_TURNS,
};

/// Message returned for queries no handler covers
pub const GENERAL_QUERY_MESSAGE: &str = "System supports GPT-4/AI queries and stock/DJIA data queries";

const DEFAULT_SUCCESS_MESSAGE: &str = "Query analyzed successfully";

// ============================================================================
// Handlers
// ============================================================================

/// A handler the dispatcher can delegate a sub-query to
pub trait QueryHandler: Send + Sync {
    fn kind(&self) -> AgentKind;
    fn run(&self, sub_query: &str) -> Result<String>;
}

/// What the model is told about one handler
#[derive(Debug, Clone, Serialize)]
pub struct HandlerSpec {
    #[serde(skip)]
    pub kind: AgentKind,
    pub intents: Vec<String>,
    pub sub_query_template: String,
    pub description: String,
}

/// Intent keywords and descriptions for every handler
#[derive(Debug, Clone)]
pub struct HandlerCatalog {
    specs: Vec<HandlerSpec>,
}

const SQL_INTENTS: &[&str] = &[
    "stock", "price", "volume", "market cap", "pe ratio", "dividend yield",
    "52 week high", "52 week low", "dividends", "stock splits",
    "sector", "industry", "country", "highest price", "lowest price",
    "average price", "total volume", "average volume", "highest volume",
    "weekly volume", "daily highlow range", "djia", "company", "ticker",
];

const RAG_INTENTS: &[&str] = &[
    "gpt-4", "ai", "technical report", "alignment", "pretraining",
    "rlhf", "sft", "safety mitigation", "fine-tuning", "post-pretraining",
    "model behavior", "human feedback", "reinforcement learning",
];

impl Default for HandlerCatalog {
    fn default() -> Self {
        let spec = |kind, intents: &[&str], description: &str| HandlerSpec {
            kind,
            intents: intents.iter().map(|s| s.to_string()).collect(),
            sub_query_template: "{query}".to_string(),
            description: description.to_string(),
        };
        Self {
            specs: vec![
                spec(
                    AgentKind::Text2Sql,
                    SQL_INTENTS,
                    "Queries database for stock prices or company info",
                ),
                spec(
                    AgentKind::Rag,
                    RAG_INTENTS,
                    "Answers questions about GPT-4 technical report or AI alignment",
                ),
            ],
        }
    }
}

impl HandlerCatalog {
    pub fn get(&self, kind: AgentKind) -> Option<&HandlerSpec> {
        self.specs.iter().find(|s| s.kind == kind)
    }

    /// Pretty JSON keyed by handler name, as embedded in the prompt
    pub fn to_prompt_json(&self) -> String {
        let map: BTreeMap<&str, &HandlerSpec> =
            self.specs.iter().map(|s| (s.kind.as_str(), s)).collect();
        serde_json::to_string_pretty(&map).unwrap_or_else(|_| "{}".to_string())
    }

    /// Sub-query for `kind` built from its template
    pub fn sub_query(&self, kind: AgentKind, query: &str) -> String {
        match self.get(kind) {
            Some(spec) => spec.sub_query_template.replace("{query}", query),
            None => query.to_string(),
        }
    }
}

// ============================================================================
// System Prompt
// ============================================================================

pub const ORCHESTRATOR_PROMPT_FILE: &str = "prompts/orchestrator.md";

/// Fallback prompt if file cannot be loaded
const FALLBACK_ORCHESTRATOR_PROMPT: &str = r#"You are Orchestrator, analyzing queries and delegating tasks to text2sql_agent or rag_agent. Return ONLY JSON output with agents, sub-queries, tickers, and date range. Do NOT include text, explanations, markdown, or code outside JSON.
Today's date is {{TODAY}}.

Input format: JSON string with "query" (current query) and "chat_history" (list of previous interactions).
- Example input: {"query": "What methods were used to align GPT-4 after pretraining?", "chat_history": [{"role": "user", "content": "Tell me about GPT-4", "timestamp": "2025-05-24 08:16:45"}, {"role": "assistant", "content": "GPT-4 is an AI model...", "timestamp": "2025-05-24 08:16:50"}]}

## 1. Context from chat history
- Use chat_history to resolve references in the current query.
- If chat_history mentions "Tell me about GPT-4" and the query is "What methods were used to align it?", "it" is GPT-4.
- Only the last {{HISTORY_LIMIT}} interactions are provided.

## 2. Analyze the current query
- Match intents:
{{TOOLS_CONFIG}}
- Prefer text2sql_agent for stock/data queries ('stock', 'price', 'volume', 'djia').
- Prefer rag_agent for AI/GPT-4 queries ('gpt-4', 'alignment', 'pretraining', 'rlhf').
- Extract:
  - tickers: e.g. ["AAPL", "MSFT"] from '(symbol: AAPL)' or company names ('Apple'); [] if not applicable. Use chat_history when the query is ambiguous ("its stock price" after "Apple").
  - date_range: 'in 2024' -> {"start_date": "2024-01-01", "end_date": "2024-12-31"}; 'on 2025-04-26' -> {"start_date": "2025-04-26", "end_date": "2025-04-26"}; null for queries that are not time based. Use chat_history for relative dates ("last year" after "2024").
- General query: agents=[], message='{{GENERAL_MESSAGE}}'.
- Invalid query: status "error".

## 3. Delegate
- Use the original query as the sub-query for each selected agent.

## 4. Output
{"status": "success"|"error", "message": "...", "data": {"agents": ["text2sql_agent"|"rag_agent"], "sub_queries": {}, "tickers": [], "date_range": null|{"start_date": "...", "end_date": "..."}}}

Example: 'What is the stock price of Apple in 2024?'
{"status": "success", "message": "Query analyzed successfully", "data": {"agents": ["text2sql_agent"], "sub_queries": {"text2sql_agent": "What is the stock price of Apple in 2024?"}, "tickers": ["AAPL"], "date_range": {"start_date": "2024-01-01", "end_date": "2024-12-31"}}}

Example: 'What methods were used to align GPT-4 after pretraining?'
{"status": "success", "message": "Query analyzed successfully", "data": {"agents": ["rag_agent"], "sub_queries": {"rag_agent": "What methods were used to align GPT-4 after pretraining?"}, "tickers": [], "date_range": null}}
"#;

/// Fill the prompt placeholders
fn render_prompt(template: &str, catalog: &HandlerCatalog, history_limit: usize) -> String {
    let today = Local::now().format("%Y-%m-%d").to_string();
    template
        .replace("{{TODAY}}", &today)
        .replace("{{TOOLS_CONFIG}}", &catalog.to_prompt_json())
        .replace("{{HISTORY_LIMIT}}", &history_limit.to_string())
        .replace("{{GENERAL_MESSAGE}}", GENERAL_QUERY_MESSAGE)
}

// ============================================================================
// Model Decision
// ============================================================================

/// Decision as the model emits it (more permissive than the envelope types)
#[derive(Deserialize, Debug, Default)]
struct RawDecision {
    status: Option<String>,
    message: Option<String>,
    #[serde(default)]
    data: RawDecisionData,
}

#[derive(Deserialize, Debug, Default)]
struct RawDecisionData {
    #[serde(default)]
    agents: Vec<String>,
    #[serde(default)]
    sub_queries: HashMap<String, String>,
    #[serde(default)]
    tickers: Vec<String>,
    date_range: Option<RawDateRange>,
}

#[derive(Deserialize, Debug)]
struct RawDateRange {
    start_date: Option<String>,
    end_date: Option<String>,
}

/// Normalize raw model output to the envelope
fn normalize_decision(raw: RawDecision) -> Envelope {
    let message = raw
        .message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SUCCESS_MESSAGE.to_string());

    if raw.status.as_deref().map(|s| s.eq_ignore_ascii_case("error")) == Some(true) {
        return Envelope::error(message);
    }

    let mut agents: Vec<AgentKind> = Vec::new();
    for name in &raw.data.agents {
        match AgentKind::parse(name) {
            Some(kind) if !agents.contains(&kind) => agents.push(kind),
            Some(_) => {}
            None => warn!(agent = %name, "Ignoring unknown agent in decision"),
        }
    }

    let sub_queries: BTreeMap<AgentKind, String> = raw
        .data
        .sub_queries
        .into_iter()
        .filter_map(|(name, q)| AgentKind::parse(&name).map(|kind| (kind, q)))
        .collect();

    let tickers = raw
        .data
        .tickers
        .into_iter()
        .map(|t| t.trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .collect();

    // A lone date means a single day
    let date_range = raw.data.date_range.and_then(|r| match (r.start_date, r.end_date) {
        (Some(start), Some(end)) => Some(DateRange { start_date: start, end_date: end }),
        (Some(day), None) | (None, Some(day)) => Some(DateRange {
            start_date: day.clone(),
            end_date: day,
        }),
        (None, None) => None,
    });

    Envelope {
        status: Status::Success,
        message,
        data: EnvelopeData {
            agents,
            sub_queries,
            tickers,
            date_range,
            result: None,
            results: BTreeMap::new(),
        },
    }
}

/// The JSON string the model receives
pub fn build_model_input(query: &str, history: &[ChatTurn], history_limit: usize) -> String {
    json!({
        "query": query,
        "chat_history": truncate_history(history, history_limit.min(MAX_HISTORY_TURNS)),
    })
    .to_string()
}

/// One result as is; several as labelled sections in run order
fn combine_results(agents: &[AgentKind], results: &BTreeMap<AgentKind, String>) -> Option<String> {
    let ran: Vec<(AgentKind, &String)> = agents
        .iter()
        .filter_map(|k| results.get(k).map(|r| (*k, r)))
        .collect();

    match ran.as_slice() {
        [] => None,
        [(_, only)] => Some((*only).clone()),
        many => Some(
            many.iter()
                .map(|(kind, text)| format!("### {}\n{}", kind, text))
                .collect::<Vec<_>>()
                .join("\n\n"),
        ),
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    model: Arc<dyn ChatModel>,
    handlers: BTreeMap<AgentKind, Arc<dyn QueryHandler>>,
    catalog: HandlerCatalog,
    prompt_template: String,
    system_prompt: String,
    history_limit: usize,
}

impl Orchestrator {
    /// Dispatcher with the built-in prompt and no handlers
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        let catalog = HandlerCatalog::default();
        let system_prompt = render_prompt(FALLBACK_ORCHESTRATOR_PROMPT, &catalog, MAX_HISTORY_TURNS);
        Self {
            model,
            handlers: BTreeMap::new(),
            catalog,
            prompt_template: FALLBACK_ORCHESTRATOR_PROMPT.to_string(),
            system_prompt,
            history_limit: MAX_HISTORY_TURNS,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn QueryHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    /// Turns forwarded to the model; never more than `MAX_HISTORY_TURNS`
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        if limit > MAX_HISTORY_TURNS {
            warn!(limit, max = MAX_HISTORY_TURNS, "History limit capped");
        }
        self.history_limit = limit.min(MAX_HISTORY_TURNS);
        self.system_prompt = render_prompt(&self.prompt_template, &self.catalog, self.history_limit);
        self
    }

    /// Use a prompt template (placeholders are filled in)
    pub fn with_prompt_template(mut self, template: &str) -> Self {
        self.prompt_template = template.to_string();
        self.system_prompt = render_prompt(template, &self.catalog, self.history_limit);
        self
    }

    /// Use the prompt at `path` when present, else the built-in one
    pub fn with_prompt_file(self, path: &Path) -> Self {
        let template = load_prompt(path, FALLBACK_ORCHESTRATOR_PROMPT);
        self.with_prompt_template(&template)
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn catalog(&self) -> &HandlerCatalog {
        &self.catalog
    }

    /// Route `query` and run the selected handlers. Never fails: errors
    /// become an error envelope.
    pub fn run(&self, query: &str, history: &[ChatTurn]) -> Envelope {
        match self.dispatch(query, history) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Error running orchestrator");
                Envelope::error(format!("Error processing query: {:#}", e))
            }
        }
    }

    /// Ask the model for a routing decision without running any handler
    pub fn decide(&self, query: &str, history: &[ChatTurn]) -> Result<Envelope> {
        let input = build_model_input(query, history, self.history_limit);
        debug!(input = %input, "Orchestrator input");

        let request = ChatRequest::new(self.system_prompt.clone(), input).json();
        let output = self
            .model
            .complete(&request)
            .context("Orchestrator model call failed")?;
        debug!(output = %output, "Orchestrator response");

        let raw: RawDecision =
            parse_json_from_text(&output).context("Orchestrator returned an invalid decision")?;
        Ok(normalize_decision(raw))
    }

    fn dispatch(&self, query: &str, history: &[ChatTurn]) -> Result<Envelope> {
        let mut envelope = self.decide(query, history)?;
        if !envelope.is_success() || envelope.data.agents.is_empty() {
            info!(message = %envelope.message, "No handler selected");
            return Ok(envelope);
        }

        let agents = envelope.data.agents.clone();
        for kind in &agents {
            let handler = self
                .handlers
                .get(kind)
                .ok_or_else(|| anyhow!("No handler registered for {}", kind))?;

            let sub_query = envelope
                .data
                .sub_queries
                .get(kind)
                .filter(|q| !q.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| self.catalog.sub_query(*kind, query));

            info!(agent = %kind, sub_query = %sub_query, "Executing handler");
            let output = handler
                .run(&sub_query)
                .with_context(|| format!("{} failed", kind))?;

            let text = if output.trim().is_empty() {
                kind.empty_result().to_string()
            } else {
                output
            };
            envelope.data.results.insert(*kind, text);
        }

        envelope.data.result = combine_results(&agents, &envelope.data.results);
        Ok(envelope)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TurnRole;
    use std::sync::Mutex;

    /// Returns a canned reply and records every request
    struct ScriptedModel {
        reply: Result<String, String>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(msg: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(msg.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn last_input(&self) -> serde_json::Value {
            let seen = self.seen.lock().unwrap();
            let req = seen.last().unwrap();
            serde_json::from_str(&req.messages[0].content).unwrap()
        }
    }

    impl ChatModel for ScriptedModel {
        fn complete(&self, request: &ChatRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone().map_err(|e| anyhow!(e))
        }
    }

    struct FakeHandler {
        kind: AgentKind,
        reply: Result<String, String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeHandler {
        fn new(kind: AgentKind, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                kind,
                reply: Ok(reply.to_string()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing(kind: AgentKind, msg: &str) -> Arc<Self> {
            Arc::new(Self {
                kind,
                reply: Err(msg.to_string()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl QueryHandler for FakeHandler {
        fn kind(&self) -> AgentKind {
            self.kind
        }

        fn run(&self, sub_query: &str) -> Result<String> {
            self.calls.lock().unwrap().push(sub_query.to_string());
            self.reply.clone().map_err(|e| anyhow!(e))
        }
    }

    const SQL_DECISION: &str = r#"{"status": "success", "message": "Query analyzed successfully",
        "data": {"agents": ["text2sql_agent"],
                 "sub_queries": {"text2sql_agent": "What is the stock price of Apple in 2024?"},
                 "tickers": ["aapl"],
                 "date_range": {"start_date": "2024-01-01", "end_date": "2024-12-31"}}}"#;

    fn history(n: usize) -> Vec<ChatTurn> {
        (0..n)
            .map(|i| ChatTurn {
                role: if i % 2 == 0 { TurnRole::User } else { TurnRole::Assistant },
                content: format!("turn {}", i),
                timestamp: "2025-05-24 08:16:45".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_prompt_contains_catalog() {
        let o = Orchestrator::new(ScriptedModel::ok("{}"));
        let prompt = o.system_prompt();
        assert!(prompt.contains("\"text2sql_agent\""));
        assert!(prompt.contains("daily highlow range"));
        assert!(prompt.contains("reinforcement learning"));
        assert!(prompt.contains(GENERAL_QUERY_MESSAGE));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn test_catalog_json_shape() {
        let v: serde_json::Value =
            serde_json::from_str(&HandlerCatalog::default().to_prompt_json()).unwrap();
        assert_eq!(v["rag_agent"]["sub_query_template"], "{query}");
        assert_eq!(v["text2sql_agent"]["intents"][0], "stock");
        assert!(v["rag_agent"].get("kind").is_none());
    }

    #[test]
    fn test_single_handler_result() {
        let model = ScriptedModel::ok(SQL_DECISION);
        let sql = FakeHandler::new(AgentKind::Text2Sql, "SQL Query: SELECT 1\nRaw Result: 1\nAnswer: 1");
        let o = Orchestrator::new(model.clone()).with_handler(sql.clone());

        let env = o.run("What is the stock price of Apple in 2024?", &[]);
        assert!(env.is_success());
        assert_eq!(env.data.tickers, vec!["AAPL"]);
        assert_eq!(env.data.date_range.as_ref().unwrap().start_date, "2024-01-01");
        assert_eq!(
            env.data.result.as_deref(),
            Some("SQL Query: SELECT 1\nRaw Result: 1\nAnswer: 1")
        );
        assert_eq!(
            sql.calls.lock().unwrap().as_slice(),
            ["What is the stock price of Apple in 2024?"]
        );
    }

    #[test]
    fn test_general_query_has_no_result() {
        let model = ScriptedModel::ok(
            r#"{"status": "success", "message": "System supports GPT-4/AI queries and stock/DJIA data queries",
                "data": {"agents": [], "sub_queries": {}, "tickers": [], "date_range": null}}"#,
        );
        let rag = FakeHandler::new(AgentKind::Rag, "unused");
        let o = Orchestrator::new(model).with_handler(rag.clone());

        let env = o.run("hello there", &[]);
        assert!(env.is_success());
        assert_eq!(env.message, GENERAL_QUERY_MESSAGE);
        assert!(env.data.result.is_none());
        assert!(rag.calls.lock().unwrap().is_empty());

        let json = serde_json::to_value(&env).unwrap();
        for key in ["status", "message", "data"] {
            assert!(json.get(key).is_some());
        }
        assert!(json["data"].get("result").is_none());
    }

    #[test]
    fn test_model_failure_becomes_error_envelope() {
        let o = Orchestrator::new(ScriptedModel::failing("connection refused"));
        let env = o.run("price of MSFT", &[]);

        assert_eq!(env.status, Status::Error);
        assert!(env.message.starts_with("Error processing query: "));
        assert!(env.message.contains("connection refused"));
        assert!(env.data.agents.is_empty());
        assert!(env.data.sub_queries.is_empty());
        assert!(env.data.date_range.is_none());
    }

    #[test]
    fn test_handler_failure_becomes_error_envelope() {
        let o = Orchestrator::new(ScriptedModel::ok(SQL_DECISION))
            .with_handler(FakeHandler::failing(AgentKind::Text2Sql, "no such table: stocks"));

        let env = o.run("price of AAPL", &[]);
        assert_eq!(env.status, Status::Error);
        assert!(env.message.contains("no such table: stocks"));
        assert!(env.data.agents.is_empty());
    }

    #[test]
    fn test_unparseable_decision_is_error() {
        let o = Orchestrator::new(ScriptedModel::ok("I think you want the SQL agent."));
        let env = o.run("price of AAPL", &[]);
        assert_eq!(env.status, Status::Error);
        assert!(env.data.agents.is_empty());
    }

    #[test]
    fn test_missing_handler_is_error() {
        let o = Orchestrator::new(ScriptedModel::ok(SQL_DECISION));
        let env = o.run("price of AAPL", &[]);
        assert_eq!(env.status, Status::Error);
        assert!(env.message.contains("No handler registered for text2sql_agent"));
    }

    #[test]
    fn test_history_truncated_to_five() {
        let model = ScriptedModel::ok(SQL_DECISION);
        let o = Orchestrator::new(model.clone())
            .with_handler(FakeHandler::new(AgentKind::Text2Sql, "ok"));

        o.run("and its volume?", &history(9));
        let input = model.last_input();
        let turns = input["chat_history"].as_array().unwrap();
        assert_eq!(turns.len(), 5);
        assert_eq!(turns[0]["content"], "turn 4");
        assert_eq!(turns[4]["content"], "turn 8");
        assert_eq!(input["query"], "and its volume?");
    }

    #[test]
    fn test_history_limit_capped_at_five() {
        let config = crate::config::RouterConfig::from_toml_str("[orchestrator]\nhistory_limit = 10").unwrap();
        let model = ScriptedModel::ok(SQL_DECISION);
        let o = Orchestrator::new(model.clone())
            .with_history_limit(config.orchestrator.history_limit)
            .with_handler(FakeHandler::new(AgentKind::Text2Sql, "ok"));

        o.run("and its volume?", &history(10));
        let input = model.last_input();
        let turns = input["chat_history"].as_array().unwrap();
        assert_eq!(turns.len(), MAX_HISTORY_TURNS);
        assert_eq!(turns[0]["content"], "turn 5");
        assert!(o.system_prompt().contains("last 5 interactions"));
    }

    #[test]
    fn test_request_uses_json_mode() {
        let model = ScriptedModel::ok(SQL_DECISION);
        let o = Orchestrator::new(model.clone())
            .with_handler(FakeHandler::new(AgentKind::Text2Sql, "ok"));
        o.run("q", &[]);

        let seen = model.seen.lock().unwrap();
        assert!(seen[0].json_mode);
        assert!(seen[0].system.as_deref().unwrap().contains("Orchestrator"));
    }

    #[test]
    fn test_two_handlers_keep_both_results() {
        let model = ScriptedModel::ok(
            r#"```json
            {"status": "success", "message": "ok",
             "data": {"agents": ["rag_agent", "text2sql_agent", "weather_agent"],
                      "sub_queries": {"rag_agent": "What is RLHF?"},
                      "tickers": [], "date_range": null}}
            ```"#,
        );
        let rag = FakeHandler::new(AgentKind::Rag, "RLHF is human feedback.");
        let sql = FakeHandler::new(AgentKind::Text2Sql, "");
        let o = Orchestrator::new(model)
            .with_handler(rag.clone())
            .with_handler(sql.clone());

        let env = o.run("Explain RLHF and NVDA price", &[]);
        assert!(env.is_success());
        assert_eq!(env.data.agents, vec![AgentKind::Rag, AgentKind::Text2Sql]);
        assert_eq!(env.data.results[&AgentKind::Rag], "RLHF is human feedback.");
        assert_eq!(env.data.results[&AgentKind::Text2Sql], "No data retrieved from SQL.");

        let combined = env.data.result.unwrap();
        assert!(combined.starts_with("### rag_agent\nRLHF is human feedback."));
        assert!(combined.contains("### text2sql_agent\nNo data retrieved from SQL."));

        // Missing sub-query falls back to the original query
        assert_eq!(sql.calls.lock().unwrap().as_slice(), ["Explain RLHF and NVDA price"]);
        assert_eq!(rag.calls.lock().unwrap().as_slice(), ["What is RLHF?"]);
    }

    #[test]
    fn test_model_reported_error_is_returned() {
        let o = Orchestrator::new(ScriptedModel::ok(
            r#"{"status": "error", "message": "Invalid query", "data": {"agents": ["rag_agent"]}}"#,
        ))
        .with_handler(FakeHandler::new(AgentKind::Rag, "unused"));

        let env = o.run("???", &[]);
        assert_eq!(env.status, Status::Error);
        assert_eq!(env.message, "Invalid query");
        assert!(env.data.agents.is_empty());
    }

    #[test]
    fn test_single_date_expands_to_range() {
        let env = normalize_decision(RawDecision {
            data: RawDecisionData {
                date_range: Some(RawDateRange {
                    start_date: Some("2025-04-26".to_string()),
                    end_date: None,
                }),
                ..Default::default()
            },
            ..Default::default()
        });
        let range = env.data.date_range.unwrap();
        assert_eq!(range.start_date, "2025-04-26");
        assert_eq!(range.end_date, "2025-04-26");
        assert_eq!(env.message, DEFAULT_SUCCESS_MESSAGE);
    }

    #[test]
    fn test_prompt_template_override() {
        let o = Orchestrator::new(ScriptedModel::ok("{}"))
            .with_history_limit(3)
            .with_prompt_template("Date {{TODAY}}; last {{HISTORY_LIMIT}}; {{TOOLS_CONFIG}}");
        assert!(o.system_prompt().contains("last 3;"));
        assert!(o.system_prompt().contains("\"rag_agent\""));
    }
}
