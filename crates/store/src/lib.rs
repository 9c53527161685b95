//! On-disk external store and its supporting machinery.
//!
//! The store keeps a session's externalized content in an append-only
//! JSONL log with a persistent index, written through a single-writer
//! queue. The warm-set tracker, token oracle, and manifest builder are
//! its close collaborators and live here with it.

pub mod manifest;
pub mod oracle;
pub mod queue;
pub mod store;
pub mod trajectory;
pub mod warm;

pub use oracle::TokenOracle;
pub use queue::{WriteHandle, WriteQueue};
pub use store::ExternalStore;
pub use warm::WarmTracker;
