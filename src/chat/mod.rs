//! Chat pipeline on top of the session coordinator and stream relay.

pub mod indent;
pub mod prompt;
pub mod service;

pub use indent::IndentNormalizer;
pub use prompt::{clean_title, FALLBACK_TITLE, PLACEHOLDER_TITLE};
pub use service::{ChatService, ResponseOutcome, SendRequest, SendTicket, TitleRetry};
