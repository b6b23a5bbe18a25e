//! Model and retrieval backends.
//!
//! [`ChatModel`] and [`Retriever`] are the seams the chat pipeline depends on.
//! The default chat model speaks the OpenAI-compatible API; the default
//! retriever returns nothing until a vector store is wired in.

pub mod compatible;
pub mod noop;
pub mod scripted;
pub mod traits;

pub use compatible::OpenAiCompatibleProvider;
pub use noop::NoopRetriever;
pub use scripted::ScriptedModel;
pub use traits::{ChatMessage, ChatModel, RetrievalFilter, RetrievedDocument, Retriever};

use std::sync::Arc;

use crate::config::ProviderConfig;

const MAX_API_ERROR_CHARS: usize = 200;

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if is_secret_char(c) {
            end = from + i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

/// Scrub known secret-like token prefixes from provider error strings.
///
/// Redacts tokens with prefixes like `sk-`, `xoxb-`, `xoxp-`, `ghp_`, `gho_`,
/// `ghu_`, and `github_pat_`.
pub fn scrub_secret_patterns(input: &str) -> String {
    const PREFIXES: [&str; 7] = [
        "sk-",
        "xoxb-",
        "xoxp-",
        "ghp_",
        "gho_",
        "ghu_",
        "github_pat_",
    ];

    let mut scrubbed = input.to_string();

    for prefix in PREFIXES {
        let mut search_from = 0;
        loop {
            let Some(rel) = scrubbed[search_from..].find(prefix) else {
                break;
            };

            let start = search_from + rel;
            let content_start = start + prefix.len();
            let end = token_end(&scrubbed, content_start);

            if end == content_start {
                search_from = content_start;
                continue;
            }

            scrubbed.replace_range(start..end, "[REDACTED]");
            search_from = start + "[REDACTED]".len();
        }
    }

    scrubbed
}

/// Sanitize API error text by scrubbing secrets and truncating length.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input);

    if scrubbed.chars().count() <= MAX_API_ERROR_CHARS {
        return scrubbed;
    }

    let mut end = MAX_API_ERROR_CHARS;
    while end > 0 && !scrubbed.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &scrubbed[..end])
}

/// Build a sanitized provider error from a failed HTTP response.
pub async fn api_error(provider: &str, response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read provider error body>".to_string());
    let sanitized = sanitize_api_error(&body);
    anyhow::anyhow!("{provider} API error ({status}): {sanitized}")
}

/// Factory: create the chat model from `[provider]`.
pub fn create_chat_model(config: &ProviderConfig) -> Arc<dyn ChatModel> {
    if config.api_key.is_none() {
        tracing::warn!(
            base_url = %config.base_url,
            "No provider API key configured; chat requests will fail until one is set"
        );
    }
    Arc::new(OpenAiCompatibleProvider::from_config(config))
}

/// Factory: create the document retriever.
pub fn create_retriever() -> Arc<dyn Retriever> {
    Arc::new(NoopRetriever)
}
