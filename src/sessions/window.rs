//! Word-budgeted history window used before every model call.

use super::types::Message;

/// Whitespace-separated word count.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Select the most recent messages that fit a word budget.
///
/// Walks backwards from the newest message, including each one and adding its
/// word count, and stops once the running total exceeds `max_words` with at
/// least `min_messages` included. The message that crosses the budget is kept.
/// Returns the selection in chronological order.
pub fn select_window(history: &[Message], max_words: usize, min_messages: usize) -> Vec<Message> {
    let mut selected = Vec::new();
    let mut words = 0usize;

    for message in history.iter().rev() {
        selected.push(message.clone());
        words += word_count(&message.content);
        if words > max_words && selected.len() >= min_messages {
            break;
        }
    }

    selected.reverse();
    selected
}

/// Apply the message cap first, then the word budget.
pub fn window_history(
    history: &[Message],
    max_messages: usize,
    max_words: usize,
    min_messages: usize,
) -> Vec<Message> {
    let start = history.len().saturating_sub(max_messages);
    select_window(&history[start..], max_words, min_messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::types::Role;

    fn message(ts: i64, words: usize) -> Message {
        Message {
            role: if ts % 2 == 0 { Role::Ai } else { Role::Human },
            content: vec!["word"; words].join(" "),
            timestamp: ts,
            pdf_id: "pdf".into(),
        }
    }

    #[test]
    fn budget_crossing_message_is_kept() {
        let history: Vec<_> = (1..=10).map(|ts| message(ts, 150)).collect();
        let window = select_window(&history, 1000, 4);

        assert_eq!(window.len(), 7);
        let stamps: Vec<_> = window.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn min_messages_overrides_budget() {
        let history: Vec<_> = (1..=6).map(|ts| message(ts, 500)).collect();
        let window = select_window(&history, 100, 4);
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].timestamp, 3);
    }

    #[test]
    fn small_history_is_returned_whole() {
        let history: Vec<_> = (1..=3).map(|ts| message(ts, 10)).collect();
        assert_eq!(select_window(&history, 1000, 4), history);
    }

    #[test]
    fn empty_history_yields_empty_window() {
        assert!(select_window(&[], 1000, 4).is_empty());
    }

    #[test]
    fn word_count_splits_on_any_whitespace() {
        assert_eq!(word_count("  one\ttwo\nthree   "), 3);
        assert_eq!(word_count(""), 0);
    }

    #[test]
    fn message_cap_applies_before_budget() {
        let history: Vec<_> = (1..=10).map(|ts| message(ts, 1)).collect();
        let window = window_history(&history, 6, 1000, 4);
        assert_eq!(window.len(), 6);
        assert_eq!(window[0].timestamp, 5);
    }
}
