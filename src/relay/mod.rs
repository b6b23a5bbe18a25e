//! Streaming chunk relay between the answer producer and the HTTP stream.

pub mod consumer;
pub mod hub;
pub mod producer;
pub mod types;

pub use consumer::{relay_events, ConsumerConfig};
pub use hub::{RelayHub, Subscription};
pub use producer::{pump, BatchConfig};
pub use types::{RelayError, RelayEvent, RelayMessage};
