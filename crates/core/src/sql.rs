//! Structured-data handler (text to SQL)
//!
//! Three steps against the stock database: the model writes one read-only
//! query from the schema, the query runs locally, and the model phrases an
//! answer from the returned rows.

use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::load_prompt;
use crate::llm::{parse_json_from_text, ChatModel, ChatRequest};
use crate::orchestrator::QueryHandler;
use crate::types::AgentKind;

pub const SQL_PROMPT_FILE: &str = "prompts/text2sql.md";

const FALLBACK_SQL_PROMPT: &str = r#"You translate questions about stocks and companies into a single SQLite query.

## Database schema
{{SCHEMA}}

## Rules
- Write exactly one read-only statement (SELECT, or WITH ... SELECT).
- Only use tables and columns from the schema above.
- Tickers are upper case (e.g. 'AAPL'). Dates are 'YYYY-MM-DD' text.
- Add a LIMIT when the question does not ask for every row.

Respond with JSON only:
{"sql": "SELECT ..."}
"#;

const ANSWER_PROMPT: &str = "You answer questions about stock market data. \
Use only the SQL result provided. Reply with one short paragraph. \
If the result has no rows, say that no matching data was found.";

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "attach", "detach", "pragma",
    "vacuum", "reindex",
];

#[derive(Error, Debug)]
pub enum SqlError {
    #[error("Model returned no SQL")]
    Empty,
    #[error("Only a single SQL statement is allowed")]
    MultipleStatements,
    #[error("Only read-only queries are allowed (found '{0}')")]
    NotReadOnly(String),
    #[error("Stock database not found: {0}")]
    MissingDatabase(PathBuf),
    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Blank out quoted literals and identifiers so their contents are not scanned
fn mask_quoted(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    for ch in sql.chars() {
        match quote {
            Some(q) if ch == q => {
                quote = None;
                out.push(ch);
            }
            Some(_) => out.push(' '),
            None => {
                if ch == '\'' || ch == '"' {
                    quote = Some(ch);
                }
                out.push(ch);
            }
        }
    }
    out
}

/// Normalize model SQL and reject anything but one read-only statement
pub fn validate_sql(raw: &str) -> Result<String, SqlError> {
    let mut sql = raw.trim();
    if let Some(stripped) = sql.strip_prefix("```sql").or_else(|| sql.strip_prefix("```")) {
        sql = stripped.trim_end_matches("```").trim();
    }
    let sql = sql.trim_end_matches(|c: char| c == ';' || c.is_whitespace()).trim();

    if sql.is_empty() {
        return Err(SqlError::Empty);
    }
    let lower = mask_quoted(sql).to_lowercase();
    if lower.contains(';') {
        return Err(SqlError::MultipleStatements);
    }

    let first = lower.split_whitespace().next().unwrap_or_default();
    if first != "select" && first != "with" {
        return Err(SqlError::NotReadOnly(first.to_string()));
    }
    for word in lower.split(|c: char| !c.is_alphanumeric() && c != '_') {
        if FORBIDDEN_KEYWORDS.contains(&word) {
            return Err(SqlError::NotReadOnly(word.to_string()));
        }
    }
    Ok(sql.to_string())
}

// ============================================================================
// Query Results
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// More rows existed than were kept
    pub truncated: bool,
}

impl QueryRows {
    /// Pipe-separated table with a header row
    pub fn to_table(&self) -> String {
        if self.rows.is_empty() {
            return "(no rows)".to_string();
        }
        let mut lines = vec![self.columns.join(" | ")];
        lines.extend(self.rows.iter().map(|r| r.join(" | ")));
        if self.truncated {
            lines.push(format!("... (first {} rows shown)", self.rows.len()));
        }
        lines.join("\n")
    }
}

fn value_to_string(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => format!("{}", (f * 10_000.0).round() / 10_000.0),
        ValueRef::Text(t) => String::from_utf8_lossy(t).to_string(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

/// `CREATE` statements for every user table and view
pub fn read_schema(conn: &Connection) -> Result<String, SqlError> {
    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL \
         ORDER BY name",
    )?;
    let ddl = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ddl.join(";\n\n"))
}

pub fn execute_query(conn: &Connection, sql: &str, max_rows: usize) -> Result<QueryRows, SqlError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let column_count = columns.len();

    let mut rows = Vec::new();
    let mut truncated = false;
    let mut rows_iter = stmt.query([])?;
    while let Some(row) = rows_iter.next()? {
        if rows.len() == max_rows {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(value_to_string(row.get_ref(i)?));
        }
        rows.push(values);
    }

    Ok(QueryRows {
        columns,
        rows,
        truncated,
    })
}

// ============================================================================
// Agent
// ============================================================================

#[derive(Deserialize, Debug)]
struct RawSql {
    sql: Option<String>,
}

pub struct Text2SqlAgent {
    db_path: PathBuf,
    model: Arc<dyn ChatModel>,
    prompt_template: String,
    max_rows: usize,
}

impl Text2SqlAgent {
    pub fn new(db_path: PathBuf, model: Arc<dyn ChatModel>) -> Self {
        Self {
            db_path,
            model,
            prompt_template: FALLBACK_SQL_PROMPT.to_string(),
            max_rows: 50,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    pub fn with_prompt_file(mut self, path: &Path) -> Self {
        self.prompt_template = load_prompt(path, FALLBACK_SQL_PROMPT);
        self
    }

    fn open(&self) -> Result<Connection, SqlError> {
        if !self.db_path.exists() {
            return Err(SqlError::MissingDatabase(self.db_path.clone()));
        }
        Ok(Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?)
    }

    /// Ask the model for a query and validate it
    pub fn generate_sql(&self, question: &str, schema: &str) -> Result<String> {
        let system = self.prompt_template.replace("{{SCHEMA}}", schema);
        let output = self
            .model
            .complete(&ChatRequest::new(system, question).json())
            .context("SQL generation failed")?;

        let raw: RawSql = parse_json_from_text(&output).context("Model returned invalid SQL JSON")?;
        let sql = validate_sql(raw.sql.as_deref().unwrap_or_default())?;
        debug!(sql = %sql, "Generated SQL");
        Ok(sql)
    }

    pub fn answer(&self, question: &str) -> Result<String> {
        let conn = self.open()?;
        let schema = read_schema(&conn)?;
        let sql = self.generate_sql(question, &schema)?;

        let rows = execute_query(&conn, &sql, self.max_rows)
            .with_context(|| format!("Query failed: {}", sql))?;
        info!(rows = rows.rows.len(), truncated = rows.truncated, "SQL executed");
        let table = rows.to_table();

        let prompt = format!("Question: {}\n\nSQL: {}\n\nResult:\n{}", question, sql, table);
        let answer = self
            .model
            .complete(&ChatRequest::new(ANSWER_PROMPT, prompt))
            .context("Answer generation failed")?;

        Ok(format_sql_response(&sql, &table, &answer))
    }
}

/// `SQL Query: ..\nRaw Result: ..\nAnswer: ..` with single-line query and answer
pub fn format_sql_response(sql: &str, table: &str, answer: &str) -> String {
    let one_line = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
    format!(
        "SQL Query: {}\nRaw Result: {}\nAnswer: {}",
        one_line(sql),
        table,
        one_line(answer)
    )
}

impl QueryHandler for Text2SqlAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Text2Sql
    }

    fn run(&self, sub_query: &str) -> Result<String> {
        self.answer(sub_query)
    }
}
