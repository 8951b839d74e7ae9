//! Extractive text summarizer.
//!
//! Picks the highest-scoring sentences by word frequency and returns them in
//! their original order. Deterministic, so it is safe to retry.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{InvocationContext, Tool, ToolError};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "in", "is", "it",
    "its", "of", "on", "or", "that", "the", "this", "to", "was", "were", "will", "with",
];

pub struct Summarize;

#[async_trait]
impl Tool for Summarize {
    fn name(&self) -> &str {
        "summarize"
    }

    fn description(&self) -> &str {
        "Summarize text by extracting its most representative sentences."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string", "description": "Text to summarize", "default": ""},
                "max_sentences": {"type": "integer", "default": 3}
            }
        })
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, _ctx: &InvocationContext) -> Result<Value, ToolError> {
        let text = args["text"].as_str().unwrap_or("");
        let max_sentences = args["max_sentences"].as_u64().unwrap_or(3) as usize;
        if max_sentences == 0 {
            return Err(ToolError::permanent("max_sentences must be at least 1"));
        }

        let sentences = split_sentences(text);
        let words = text.split_whitespace().count();
        let summary = summarize(&sentences, max_sentences);

        Ok(json!({
            "summary": summary,
            "sentences": sentences.len(),
            "words": words,
        }))
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if sentence.chars().any(char::is_alphanumeric) {
                out.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if tail.chars().any(char::is_alphanumeric) {
        out.push(tail);
    }
    out
}

fn tokens(sentence: &str) -> impl Iterator<Item = String> + '_ {
    sentence
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
}

fn summarize(sentences: &[&str], max_sentences: usize) -> String {
    if sentences.len() <= max_sentences {
        return sentences.join(" ");
    }

    let mut freq: HashMap<String, usize> = HashMap::new();
    for sentence in sentences {
        for word in tokens(sentence) {
            *freq.entry(word).or_default() += 1;
        }
    }

    let mut scored: Vec<(usize, f64)> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let words: Vec<String> = tokens(s).collect();
            let score = if words.is_empty() {
                0.0
            } else {
                words.iter().map(|w| freq[w] as f64).sum::<f64>() / words.len() as f64
            };
            (i, score)
        })
        .collect();

    // Highest score first, earlier sentence wins ties
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut picked: Vec<usize> = scored.into_iter().take(max_sentences).map(|(i, _)| i).collect();
    picked.sort_unstable();

    picked
        .into_iter()
        .map(|i| sentences[i])
        .collect::<Vec<_>>()
        .join(" ")
}
