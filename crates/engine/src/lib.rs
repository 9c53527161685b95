//! The recursive query engine.
//!
//! Owns the call tree, cost accounting, bounded concurrency, the search
//! sub-tool, and the child agent loop that powers `rlm_query` and
//! `rlm_batch`. Model calls go through the [`adapter::ModelAdapter`]
//! trait; the concrete provider lives with the host.

pub mod adapter;
pub mod agent;
pub mod calltree;
pub mod cost;
pub mod engine;
pub mod limiter;
pub mod prompt;
pub mod search;

pub use adapter::{CallOptions, Completion, CompletionRequest, ModelAdapter, ModelRegistry, Usage};
pub use calltree::{CallNode, CallStatus, CallTree};
pub use engine::{QueryArgs, RecursiveEngine};
