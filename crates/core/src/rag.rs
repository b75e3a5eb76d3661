//! Document-retrieval handler
//!
//! Answers questions about the indexed PDF: retrieves the top passages,
//! stuffs them into the prompt and has the model quote them before
//! answering. Turns are kept per session in the SQLite store.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::load_prompt;
use crate::knowledge::{KbHit, Retriever};
use crate::llm::{ChatMessage, ChatModel, ChatRequest};
use crate::orchestrator::QueryHandler;
use crate::session::SessionStore;
use crate::types::{AgentKind, ChatTurn, TurnRole};

/// Exact reply when the knowledge base has nothing relevant
pub const NO_INFORMATION_REPLY: &str = "No relevant information found in the document.";

pub const DEFAULT_SESSION_ID: &str = "default";

pub const RAG_PROMPT_FILE: &str = "prompts/rag_agent.md";

const FALLBACK_RAG_INSTRUCTIONS: &str = r#"You are a RAG assistant that analyzes the content of a PDF document.
- Always quote 1-3 original passages from the knowledge base (KB hits) before giving your answer.
- If the question is not in English, the knowledge base was searched with an English translation; answer in the language of the question.
- If none of the KB hits is relevant, reply only: 'No relevant information found in the document.'
- Format the reply clearly with a 'KB hits' section followed by an 'Answer' section.
"#;

const TRANSLATE_PROMPT: &str = "Translate the user's question into English for a document search. \
Reply with the translated question only.";

pub struct RagAgent {
    retriever: Arc<dyn Retriever>,
    model: Arc<dyn ChatModel>,
    sessions: Option<SessionStore>,
    session_id: String,
    instructions: String,
    top_k: usize,
    history_turns: usize,
}

impl RagAgent {
    pub fn new(retriever: Arc<dyn Retriever>, model: Arc<dyn ChatModel>) -> Self {
        Self {
            retriever,
            model,
            sessions: None,
            session_id: DEFAULT_SESSION_ID.to_string(),
            instructions: FALLBACK_RAG_INSTRUCTIONS.to_string(),
            top_k: 5,
            history_turns: 6,
        }
    }

    pub fn with_sessions(mut self, store: SessionStore) -> Self {
        self.sessions = Some(store);
        self
    }

    /// Session used by [`QueryHandler::run`]
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = id.into();
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k.max(1);
        self
    }

    pub fn with_history_turns(mut self, n: usize) -> Self {
        self.history_turns = n;
        self
    }

    pub fn with_prompt_file(mut self, path: &Path) -> Self {
        self.instructions = load_prompt(path, FALLBACK_RAG_INSTRUCTIONS);
        self
    }

    pub fn ask(&self, question: &str) -> Result<String> {
        self.ask_in_session(&self.session_id, question)
    }

    pub fn ask_in_session(&self, session_id: &str, question: &str) -> Result<String> {
        let search_query = self.search_query(question)?;
        let hits = self
            .retriever
            .search(&search_query, self.top_k)
            .context("Knowledge base search failed")?;
        debug!(hits = hits.len(), query = %search_query, "Retrieved KB hits");

        let answer = if hits.is_empty() {
            info!("No KB hits, skipping model call");
            NO_INFORMATION_REPLY.to_string()
        } else {
            let history = self.history(session_id);
            let request = self.build_request(question, &search_query, &hits, &history);
            self.model
                .complete(&request)
                .context("RAG model call failed")?
                .trim()
                .to_string()
        };

        self.record(session_id, question, &answer);
        Ok(answer)
    }

    /// The question in English; questions in other scripts are translated first
    fn search_query(&self, question: &str) -> Result<String> {
        if looks_english(question) {
            return Ok(question.to_string());
        }
        let translated = self
            .model
            .complete(&ChatRequest::new(TRANSLATE_PROMPT, question))
            .context("Question translation failed")?;
        let translated = translated.trim();
        if translated.is_empty() {
            Ok(question.to_string())
        } else {
            debug!(original = %question, translated = %translated, "Translated question");
            Ok(translated.to_string())
        }
    }

    fn history(&self, session_id: &str) -> Vec<ChatTurn> {
        let Some(store) = &self.sessions else {
            return Vec::new();
        };
        match store.recent(session_id, self.history_turns) {
            Ok(mut turns) => {
                // The replay starts on a question, never on an orphan answer
                let skip = turns
                    .iter()
                    .take_while(|t| t.role == TurnRole::Assistant)
                    .count();
                turns.drain(..skip);
                turns
            }
            Err(e) => {
                warn!(error = %e, "Failed to read session history");
                Vec::new()
            }
        }
    }

    fn record(&self, session_id: &str, question: &str, answer: &str) {
        let Some(store) = &self.sessions else {
            return;
        };
        for turn in [ChatTurn::user(question), ChatTurn::assistant(answer)] {
            if let Err(e) = store.append(session_id, &turn) {
                warn!(error = %e, "Failed to store chat turn");
            }
        }
    }

    fn build_request(
        &self,
        question: &str,
        search_query: &str,
        hits: &[KbHit],
        history: &[ChatTurn],
    ) -> ChatRequest {
        let mut messages: Vec<ChatMessage> = history
            .iter()
            .map(|t| match t.role {
                TurnRole::User => ChatMessage::user(t.content.clone()),
                TurnRole::Assistant => ChatMessage::assistant(t.content.clone()),
            })
            .collect();

        let mut prompt = String::from("Use the following KB hits to answer.\n\n");
        prompt.push_str(&format_hits(hits));
        if search_query != question {
            prompt.push_str(&format!("\nSearch query used: {}\n", search_query));
        }
        prompt.push_str(&format!("\nQuestion: {}", question));
        messages.push(ChatMessage::user(prompt));

        ChatRequest {
            system: Some(self.instructions.clone()),
            messages,
            json_mode: false,
        }
    }
}

/// Share of ASCII among the letters of the question. Typographic quotes,
/// dashes and digits are not letters and do not count.
fn looks_english(text: &str) -> bool {
    let (ascii, total) = text
        .chars()
        .filter(|c| c.is_alphabetic())
        .fold((0usize, 0usize), |(a, t), c| (a + c.is_ascii() as usize, t + 1));
    total == 0 || ascii * 10 >= total * 9
}

/// Numbered passages with page and score
fn format_hits(hits: &[KbHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| {
            let page = hit
                .page
                .map(|p| format!("page {}, ", p))
                .unwrap_or_default();
            format!("[{}] ({}score {:.2})\n{}\n", i + 1, page, hit.score, hit.content.trim())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl QueryHandler for RagAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Rag
    }

    fn run(&self, sub_query: &str) -> Result<String> {
        self.ask(sub_query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    struct FixedRetriever {
        hits: Vec<KbHit>,
        queries: Mutex<Vec<String>>,
    }

    impl FixedRetriever {
        fn new(hits: Vec<KbHit>) -> Arc<Self> {
            Arc::new(Self {
                hits,
                queries: Mutex::new(Vec::new()),
            })
        }
    }

    impl Retriever for FixedRetriever {
        fn search(&self, query: &str, limit: usize) -> Result<Vec<KbHit>> {
            self.queries.lock().unwrap().push(query.to_string());
            Ok(self.hits.iter().take(limit).cloned().collect())
        }
    }

    struct RecordingModel {
        replies: Mutex<Vec<String>>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl RecordingModel {
        /// Replies are handed out in order
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl ChatModel for RecordingModel {
        fn complete(&self, request: &ChatRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow!("no scripted reply"))
        }
    }

    fn hit(content: &str, page: u32) -> KbHit {
        KbHit {
            content: content.to_string(),
            score: 0.8,
            page: Some(page),
            chunk: None,
        }
    }

    #[test]
    fn test_no_hits_short_circuits() {
        let model = RecordingModel::new(&[]);
        let agent = RagAgent::new(FixedRetriever::new(vec![]), model.clone());

        assert_eq!(agent.ask("What is RLHF?").unwrap(), NO_INFORMATION_REPLY);
        assert!(model.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_hits_are_stuffed_into_prompt() {
        let retriever = FixedRetriever::new(vec![
            hit("GPT-4 was fine-tuned using RLHF.", 12),
            hit("Rule-based reward models were used.", 13),
        ]);
        let model = RecordingModel::new(&["KB hits: ...\nAnswer: RLHF and RBRMs."]);
        let agent = RagAgent::new(retriever.clone(), model.clone()).with_top_k(5);

        let answer = agent
            .ask("What methods were used to align GPT-4 after pretraining?")
            .unwrap();
        assert_eq!(answer, "KB hits: ...\nAnswer: RLHF and RBRMs.");

        let seen = model.seen.lock().unwrap();
        let req = &seen[0];
        assert!(req.system.as_deref().unwrap().contains("KB hits"));
        let user = &req.messages.last().unwrap().content;
        assert!(user.contains("[1] (page 12, score 0.80)\nGPT-4 was fine-tuned using RLHF."));
        assert!(user.contains("[2] (page 13"));
        assert!(user.ends_with("Question: What methods were used to align GPT-4 after pretraining?"));
    }

    #[test]
    fn test_non_english_question_is_translated_for_search() {
        let retriever = FixedRetriever::new(vec![hit("Safety mitigations included red teaming.", 40)]);
        let model = RecordingModel::new(&["What safety mitigations were used?", "Answer: red teaming."]);
        let agent = RagAgent::new(retriever.clone(), model.clone());

        let answer = agent.ask("Những biện pháp an toàn nào đã được sử dụng?").unwrap();
        assert_eq!(answer, "Answer: red teaming.");
        assert_eq!(
            retriever.queries.lock().unwrap().as_slice(),
            ["What safety mitigations were used?"]
        );
        assert_eq!(model.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_looks_english() {
        assert!(looks_english("How was GPT\u{2011}4\u{2019}s alignment evaluated?"));
        assert!(looks_english("What is RLHF? \u{201c}quoted\u{201d}"));
        assert!(looks_english("2025-02-28"));
        assert!(!looks_english("Những biện pháp an toàn nào đã được sử dụng?"));
        assert!(!looks_english("GPT-4 的训练数据是什么？"));
    }

    #[test]
    fn test_typographic_punctuation_is_not_translated() {
        let retriever = FixedRetriever::new(vec![hit("Alignment used RLHF.", 12)]);
        let model = RecordingModel::new(&["Answer: RLHF."]);
        let agent = RagAgent::new(retriever.clone(), model.clone());

        let question = "How was GPT\u{2011}4\u{2019}s alignment evaluated?";
        assert_eq!(agent.ask(question).unwrap(), "Answer: RLHF.");
        assert_eq!(retriever.queries.lock().unwrap().as_slice(), [question]);
        assert_eq!(model.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_odd_history_window_starts_with_question() {
        let retriever = FixedRetriever::new(vec![hit("GPT-4 is multimodal.", 1)]);
        let model = RecordingModel::new(&["First answer.", "Second answer.", "Third answer."]);
        let agent = RagAgent::new(retriever, model.clone())
            .with_sessions(SessionStore::in_memory().unwrap())
            .with_history_turns(3);

        agent.ask("First question").unwrap();
        agent.ask("Second question").unwrap();

        // Last 3 stored turns are [answer 1, question 2, answer 2]
        let history = agent.history(DEFAULT_SESSION_ID);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, TurnRole::User);
        assert_eq!(history[0].content, "Second question");

        agent.ask("Third question").unwrap();
        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[2].messages[0].content, "Second question");
    }

    #[test]
    fn test_session_history_is_replayed() {
        let retriever = FixedRetriever::new(vec![hit("GPT-4 is multimodal.", 1)]);
        let model = RecordingModel::new(&["It accepts images and text.", "Yes, images."]);
        let agent = RagAgent::new(retriever, model.clone())
            .with_sessions(SessionStore::in_memory().unwrap())
            .with_session_id("s1");

        agent.ask("Tell me about GPT-4").unwrap();
        agent.ask("Does it take images?").unwrap();

        let seen = model.seen.lock().unwrap();
        let second = &seen[1];
        assert_eq!(second.messages.len(), 3);
        assert_eq!(second.messages[0].content, "Tell me about GPT-4");
        assert_eq!(second.messages[1].content, "It accepts images and text.");

        // Other sessions do not see it
        let other = agent.history("s2");
        assert!(other.is_empty());
    }

    #[test]
    fn test_query_handler_kind() {
        let agent = RagAgent::new(FixedRetriever::new(vec![]), RecordingModel::new(&[]));
        assert_eq!(agent.kind(), AgentKind::Rag);
        assert_eq!(agent.run("anything").unwrap(), NO_INFORMATION_REPLY);
    }
}
