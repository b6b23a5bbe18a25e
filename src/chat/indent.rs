//! Strips stray indentation that models emit at the start of answer lines.

/// Stateful line-start normalizer for a chunked text stream.
///
/// Horizontal whitespace (spaces and tabs) at the beginning of a line is
/// removed; newlines and all other characters pass through untouched. The
/// "at line start" state carries across chunks, so a line whose indentation is
/// split over several chunks is still normalized.
#[derive(Debug, Clone)]
pub struct IndentNormalizer {
    at_line_start: bool,
}

impl Default for IndentNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl IndentNormalizer {
    pub fn new() -> Self {
        Self {
            at_line_start: true,
        }
    }

    /// Normalize one chunk. May return an empty string.
    pub fn push(&mut self, chunk: &str) -> String {
        let mut out = String::with_capacity(chunk.len());
        for segment in chunk.split_inclusive('\n') {
            let segment = if self.at_line_start {
                segment.trim_start_matches([' ', '\t'])
            } else {
                segment
            };
            out.push_str(segment);
            if segment.ends_with('\n') {
                self.at_line_start = true;
            } else if !segment.is_empty() {
                self.at_line_start = false;
            }
        }
        out
    }
}
