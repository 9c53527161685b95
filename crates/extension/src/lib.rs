//! The host-facing RLM extension.
//!
//! Wires the external store, warm tracker, token oracle, call tree, and
//! recursive engine into one session, and exposes the host contract:
//! lifecycle event handlers, the `rlm_*` tool surface, and the `/rlm`
//! slash command.

pub mod commands;
pub mod externalizer;
pub mod fingerprint;
pub mod host;
pub mod session;
pub mod tools;

#[cfg(test)]
pub(crate) mod testutil;

pub use host::{CompactDecision, ContextUsage, HostContext, ToolOutput};
pub use session::RlmSession;
