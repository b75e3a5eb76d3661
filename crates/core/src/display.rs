//! Turning envelopes into what the pages show

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::types::{AgentKind, Envelope};

/// Shown for a success envelope that carries no result
pub const NO_SPECIFIC_RESULT: &str = "No specific result.";

const UNPARSED_SQL_WARNING: &str = "Could not extract the SQL query or answer from the response.";

fn sql_response_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)SQL Query: (.*?)\nRaw Result:.*?\nAnswer: (.*?)(?:\n|$)").ok())
        .as_ref()
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlAnswer {
    pub sql: String,
    pub answer: String,
}

/// Pull the query and answer out of a structured-data handler result
pub fn parse_sql_response(text: &str) -> Option<SqlAnswer> {
    let caps = sql_response_re()?.captures(text)?;
    Some(SqlAnswer {
        sql: caps.get(1)?.as_str().trim().to_string(),
        answer: caps.get(2)?.as_str().trim().to_string(),
    })
}

/// One block of page output
#[derive(Debug, Clone, PartialEq)]
pub enum Rendered {
    Error(String),
    Sql(SqlAnswer),
    /// SQL handler output that did not match the expected layout
    Unparsed(String),
    Text(String),
}

impl fmt::Display for Rendered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rendered::Error(message) => write!(f, "Error: {}", message),
            Rendered::Sql(a) => write!(f, "Answer:\n{}\n\nSQL Query:\n```sql\n{}\n```", a.answer, a.sql),
            Rendered::Unparsed(raw) => write!(f, "{}\n{}", UNPARSED_SQL_WARNING, raw),
            Rendered::Text(text) => f.write_str(text),
        }
    }
}

fn render_handler(kind: AgentKind, text: &str) -> Rendered {
    match kind {
        AgentKind::Text2Sql => match parse_sql_response(text) {
            Some(answer) => Rendered::Sql(answer),
            None => Rendered::Unparsed(text.to_string()),
        },
        AgentKind::Rag => Rendered::Text(text.to_string()),
    }
}

/// Page layout for an envelope, one block per handler that ran
pub fn render_envelope(envelope: &Envelope) -> Vec<Rendered> {
    if !envelope.is_success() {
        return vec![Rendered::Error(envelope.message.clone())];
    }
    let data = &envelope.data;

    let blocks: Vec<Rendered> = data
        .agents
        .iter()
        .filter_map(|kind| data.results.get(kind).map(|text| render_handler(*kind, text)))
        .collect();
    if !blocks.is_empty() {
        return blocks;
    }

    // Envelopes without per-handler results (e.g. deserialized from elsewhere)
    match (&data.result, data.agents.contains(&AgentKind::Text2Sql)) {
        (Some(result), true) => vec![render_handler(AgentKind::Text2Sql, result)],
        (Some(result), false) => vec![Rendered::Text(result.clone())],
        (None, _) => vec![Rendered::Text(NO_SPECIFIC_RESULT.to_string())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnvelopeData;

    const SQL_OUTPUT: &str = "SQL Query: SELECT close FROM prices WHERE ticker = 'AAPL' AND date = '2025-02-28'\n\
                              Raw Result: close\n241.84\n\
                              Answer: Apple closed at $241.84 on 2025-02-28.";

    #[test]
    fn test_parse_sql_response() {
        let parsed = parse_sql_response(SQL_OUTPUT).unwrap();
        assert_eq!(
            parsed.sql,
            "SELECT close FROM prices WHERE ticker = 'AAPL' AND date = '2025-02-28'"
        );
        assert_eq!(parsed.answer, "Apple closed at $241.84 on 2025-02-28.");
    }

    #[test]
    fn test_parse_stops_answer_at_newline() {
        let parsed = parse_sql_response("SQL Query: SELECT 1\nRaw Result: 1\nAnswer: one\nextra").unwrap();
        assert_eq!(parsed.answer, "one");
        assert!(parse_sql_response("Apple closed at $241.84").is_none());
    }

    #[test]
    fn test_render_error() {
        let out = render_envelope(&Envelope::error("Error processing query: timeout"));
        assert_eq!(out, vec![Rendered::Error("Error processing query: timeout".to_string())]);
        assert_eq!(out[0].to_string(), "Error: Error processing query: timeout");
    }

    #[test]
    fn test_render_default_when_no_result() {
        let env = Envelope::success("System supports GPT-4/AI queries and stock/DJIA data queries", EnvelopeData::default());
        assert_eq!(
            render_envelope(&env),
            vec![Rendered::Text(NO_SPECIFIC_RESULT.to_string())]
        );
    }

    #[test]
    fn test_render_per_handler_blocks() {
        let mut data = EnvelopeData {
            agents: vec![AgentKind::Text2Sql, AgentKind::Rag],
            ..Default::default()
        };
        data.results.insert(AgentKind::Text2Sql, SQL_OUTPUT.to_string());
        data.results.insert(AgentKind::Rag, "KB hits: ...\nAnswer: RLHF".to_string());

        let out = render_envelope(&Envelope::success("ok", data));
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Rendered::Sql(a) if a.answer.starts_with("Apple closed")));
        assert_eq!(out[1], Rendered::Text("KB hits: ...\nAnswer: RLHF".to_string()));
        assert!(out[0].to_string().contains("```sql\nSELECT close"));
    }

    #[test]
    fn test_render_unparsed_sql_result() {
        let data = EnvelopeData {
            agents: vec![AgentKind::Text2Sql],
            result: Some("The model rambled".to_string()),
            ..Default::default()
        };
        let out = render_envelope(&Envelope::success("ok", data));
        assert_eq!(out, vec![Rendered::Unparsed("The model rambled".to_string())]);
        assert!(out[0].to_string().starts_with(UNPARSED_SQL_WARNING));
    }
}
