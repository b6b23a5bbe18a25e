//! Prompt construction for answers and session titles.

use crate::providers::{ChatMessage, RetrievedDocument};
use crate::sessions::Message;

pub const PLACEHOLDER_TITLE: &str = "New Chat";
pub const FALLBACK_TITLE: &str = "Untitled Session";

const MAX_TITLE_WORDS: usize = 5;

const ANSWER_INSTRUCTIONS: &str = "\
You are a helpful assistant answering questions about the user's documents.
Base your answer on the Retrieved Documents section. If they do not contain the \
answer, say so plainly; any general knowledge you add must be labelled as coming \
from outside the documents.
Use the Chat History to keep the conversation's context and avoid repeating \
earlier answers. Ask for clarification when the question is ambiguous.
Keep answers concise and focused on the question.";

/// Build the answer prompt from the windowed history, the retrieved
/// documents and the new question.
pub fn answer_prompt(
    history: &[Message],
    documents: &[RetrievedDocument],
    question: &str,
) -> Vec<ChatMessage> {
    let history_block = if history.is_empty() {
        "(none)".to_string()
    } else {
        history
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let documents_block = if documents.is_empty() {
        "(none)".to_string()
    } else {
        documents
            .iter()
            .map(|doc| match doc.page {
                Some(page) => format!("[page {page}] {}", doc.content),
                None => doc.content.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    vec![
        ChatMessage::system(ANSWER_INSTRUCTIONS),
        ChatMessage::user(format!(
            "Chat History:\n{history_block}\n---\nRetrieved Documents:\n{documents_block}\n---\nUser Question: {question}"
        )),
    ]
}

pub fn title_prompt(first_message: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "Generate a formal, concise title (3-6 words) for a professional chat session. \
             Respond only with the title.",
        ),
        ChatMessage::user(format!("Initial message: {first_message}")),
    ]
}

/// Trim quotes and whitespace and cap the title length. Empty results fall
/// back to [`FALLBACK_TITLE`].
pub fn clean_title(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    let words: Vec<&str> = trimmed.split_whitespace().take(MAX_TITLE_WORDS).collect();
    if words.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        words.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::Role;

    #[test]
    fn clean_title_strips_quotes_and_caps_words() {
        assert_eq!(clean_title("  \"Quarterly Report Review\"\n"), "Quarterly Report Review");
        assert_eq!(
            clean_title("One Two Three Four Five Six Seven"),
            "One Two Three Four Five"
        );
        assert_eq!(clean_title(" \"\" "), FALLBACK_TITLE);
    }

    #[test]
    fn answer_prompt_carries_history_documents_and_question() {
        let history = vec![Message {
            role: Role::Human,
            content: "What is on page 2?".into(),
            timestamp: 1,
            pdf_id: "pdf".into(),
        }];
        let documents = vec![RetrievedDocument {
            content: "Revenue grew.".into(),
            page: Some(2),
            score: None,
        }];
        let prompt = answer_prompt(&history, &documents, "And page 3?");

        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[0].role, "system");
        let body = &prompt[1].content;
        assert!(body.contains("human: What is on page 2?"));
        assert!(body.contains("[page 2] Revenue grew."));
        assert!(body.ends_with("User Question: And page 3?"));
    }

    #[test]
    fn empty_sections_are_marked() {
        let prompt = answer_prompt(&[], &[], "hi");
        assert_eq!(prompt[1].content.matches("(none)").count(), 2);
    }
}
