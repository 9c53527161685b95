//! Shared domain types for the RLM context-externalization engine.
//!
//! Everything the other crates agree on lives here: the error enum, the
//! runtime configuration, host message sum types, store record shapes,
//! the structured child-result contract, and the inter-extension events.

pub mod child;
pub mod config;
pub mod error;
pub mod events;
pub mod message;
pub mod record;

pub use error::{Error, Result};
