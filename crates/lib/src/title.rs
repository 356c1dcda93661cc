//! Session titles derived from the first real user message.
//!
//! Generation is best-effort: it never fails, and callers run it off the send path.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{Config, TitleMode};
use crate::llm::BackendError;

const SUMMARY_MAX_CHARS: usize = 30;

/// A model that can compress a message into a short phrase.
#[async_trait]
pub trait TitleSummarizer: Send + Sync {
    async fn summarize(&self, first_message: &str) -> Result<String, BackendError>;
}

#[derive(Clone)]
pub enum TitleGenerator {
    /// Cut the message to `max_chars` characters, appending `...` when cut.
    Truncate { max_chars: usize },
    /// Ask a model; fall back to a fixed label on failure.
    Summarize {
        summarizer: Arc<dyn TitleSummarizer>,
        fallback: String,
    },
}

impl Default for TitleGenerator {
    fn default() -> Self {
        TitleGenerator::Truncate { max_chars: 15 }
    }
}

/// Single-line, trimmed, at most `max_chars` characters plus `...` if shortened.
pub fn truncate_title(text: &str, max_chars: usize) -> String {
    let clean = text.trim().replace(['\r', '\n'], " ");
    if clean.chars().count() > max_chars {
        let cut: String = clean.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        clean
    }
}

/// Strip quotes, markdown emphasis and trailing punctuation a model tends to add; first line only.
fn clean_summary(raw: &str) -> String {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let trimmed = line
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '*' | '#' | '`' | '“' | '”' | '「' | '」'))
        .trim_end_matches(['.', '。', '!', '！'])
        .trim();
    trimmed.chars().take(SUMMARY_MAX_CHARS).collect()
}

impl TitleGenerator {
    pub fn from_config(config: &Config, summarizer: Option<Arc<dyn TitleSummarizer>>) -> Self {
        match (config.title.mode, summarizer) {
            (TitleMode::Summarize, Some(summarizer)) => TitleGenerator::Summarize {
                summarizer,
                fallback: config.title.fallback.clone(),
            },
            (TitleMode::Summarize, None) => {
                log::warn!("title: summarize mode needs a Gemini key, truncating instead");
                TitleGenerator::Truncate {
                    max_chars: config.title.max_chars,
                }
            }
            (TitleMode::Truncate, _) => TitleGenerator::Truncate {
                max_chars: config.title.max_chars,
            },
        }
    }

    pub async fn generate(&self, first_message: &str) -> String {
        match self {
            TitleGenerator::Truncate { max_chars } => truncate_title(first_message, *max_chars),
            TitleGenerator::Summarize {
                summarizer,
                fallback,
            } => match summarizer.summarize(first_message).await {
                Ok(raw) => {
                    let title = clean_summary(&raw);
                    if title.is_empty() {
                        fallback.clone()
                    } else {
                        title
                    }
                }
                Err(e) => {
                    log::warn!("title: summary failed, using fallback: {}", e);
                    fallback.clone()
                }
            },
        }
    }
}
