//! The contract the host runtime provides to this extension.
//!
//! The host dispatches lifecycle events, registers tools and slash
//! commands, and exposes session facts (cwd, model, context usage) plus
//! optional UI hooks. Everything here is consumed through this trait so
//! the core stays host-agnostic and testable.

use std::path::PathBuf;

use serde_json::Value;

use rlm_domain::Result;

/// Current context-window usage as the host reports it.
#[derive(Debug, Clone, Copy)]
pub struct ContextUsage {
    /// Tokens currently in the window, when the host can measure them.
    pub tokens: Option<u64>,
    /// The model's context window size.
    pub context_window: u64,
}

/// Decision returned from the `session_before_compact` handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactDecision {
    pub cancel: bool,
}

/// Result shape every tool handler returns to the host.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
    pub details: Option<Value>,
}

impl ToolOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
            details: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Host runtime surface consumed by the session.
#[async_trait::async_trait]
pub trait HostContext: Send + Sync {
    /// Current working directory of the host session.
    fn cwd(&self) -> PathBuf;

    /// Stable identifier of the host session.
    fn session_id(&self) -> String;

    /// Whether an interactive UI is attached.
    fn has_ui(&self) -> bool;

    /// Current token usage and window size.
    fn context_usage(&self) -> ContextUsage;

    /// The session's resolved model identifier, if any.
    fn model(&self) -> Option<String>;

    /// Model identifiers the host knows about.
    fn known_models(&self) -> Vec<String>;

    /// Show a notification (UI when available, console otherwise).
    fn notify(&self, message: &str);

    /// Ask the user to confirm an action. Hosts without a UI return the
    /// default answer.
    async fn confirm(&self, message: &str) -> bool;

    /// Publish an inter-extension event on the host bus.
    fn emit_event(&self, name: &str, payload: Value) -> Result<()>;

    /// Persist one configuration entry with the session.
    fn append_entry(&self, kind: &str, data: Value);
}
