//! Demo mode: unauthenticated, in-process chats that never reach the session tiers.

pub mod registry;
pub mod service;
pub mod sweep;

pub use registry::{DemoMessage, DemoRegistry};
pub use service::{DemoService, DEMO_USER_ID};
pub use sweep::DemoSweeper;
