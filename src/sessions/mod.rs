//! Session state: data model, the two-tier coordinator, flush policy and
//! history windowing.

pub mod cli;
pub mod clock;
pub mod coordinator;
pub mod keys;
pub mod locks;
pub mod policy;
pub mod types;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::SessionCoordinator;
pub use policy::{FlushDecision, FlushPolicy, PendingState};
pub use types::{FastTierRecord, FlushOutcome, Message, Role, SessionError, SessionResult};
pub use window::{select_window, window_history, word_count};
