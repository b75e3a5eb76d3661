//! Semantic text splitting
//!
//! Splits page text into sentences, embeds each sentence together with its
//! neighbours, and starts a new chunk wherever the cosine distance between
//! consecutive windows is unusually large (above a percentile of all
//! distances in the document).

use crate::embed::{cosine_similarity, EmbedError, Embedder};

#[derive(Debug, Clone)]
pub struct SemanticChunker {
    /// Sentences on each side included in a sentence's embedding window
    pub buffer_size: usize,
    /// Distances above this percentile become chunk boundaries
    pub breakpoint_percentile: f32,
    /// Chunks longer than this are split on whitespace
    pub max_chunk_chars: usize,
}

impl Default for SemanticChunker {
    fn default() -> Self {
        Self {
            buffer_size: 1,
            breakpoint_percentile: 95.0,
            max_chunk_chars: 4000,
        }
    }
}

impl SemanticChunker {
    pub fn split(&self, text: &str, embedder: &dyn Embedder) -> Result<Vec<String>, EmbedError> {
        let sentences = split_sentences(text);

        let chunks = match sentences.len() {
            0 => return Ok(Vec::new()),
            1 => sentences,
            _ => {
                let windows = self.windows(&sentences);
                let embeddings = embedder.embed_documents(&windows)?;
                let distances: Vec<f32> = embeddings
                    .windows(2)
                    .map(|pair| 1.0 - cosine_similarity(&pair[0], &pair[1]))
                    .collect();
                group_at_breakpoints(
                    &sentences,
                    &distances,
                    percentile(&distances, self.breakpoint_percentile),
                )
            }
        };

        Ok(chunks
            .into_iter()
            .flat_map(|c| hard_split(&c, self.max_chunk_chars))
            .collect())
    }

    fn windows(&self, sentences: &[String]) -> Vec<String> {
        (0..sentences.len())
            .map(|i| {
                let lo = i.saturating_sub(self.buffer_size);
                let hi = (i + self.buffer_size + 1).min(sentences.len());
                sentences[lo..hi].join(" ")
            })
            .collect()
    }
}

/// Split on sentence punctuation followed by whitespace, and on blank lines
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();

    for paragraph in text.split("\n\n") {
        let mut current = String::new();
        let mut chars = paragraph.chars().peekable();

        while let Some(ch) = chars.next() {
            current.push(ch);
            if matches!(ch, '.' | '?' | '!') && chars.peek().map_or(true, |c| c.is_whitespace()) {
                push_sentence(&mut out, &current);
                current.clear();
            }
        }
        push_sentence(&mut out, &current);
    }

    out
}

fn push_sentence(out: &mut Vec<String>, raw: &str) {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if !normalized.is_empty() {
        out.push(normalized);
    }
}

/// Linear-interpolated percentile (0-100) of the values
pub fn percentile(values: &[f32], pct: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// `distances[i]` is the gap between sentence i and i + 1
fn group_at_breakpoints(sentences: &[String], distances: &[f32], threshold: f32) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut start = 0;

    for (i, d) in distances.iter().enumerate() {
        if *d > threshold {
            chunks.push(sentences[start..=i].join(" "));
            start = i + 1;
        }
    }
    if start < sentences.len() {
        chunks.push(sentences[start..].join(" "));
    }
    chunks
}

fn hard_split(chunk: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || chunk.chars().count() <= max_chars {
        return vec![chunk.to_string()];
    }

    let mut out = Vec::new();
    let mut current = String::new();
    for word in chunk.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > max_chars {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
