//! Model-call adapter contract.
//!
//! The host supplies the concrete provider; the engine only needs two
//! entry points with the same response shape. When `complete` reports
//! that non-streaming calls are unsupported, the agent loop switches to
//! `stream` for the remainder of that loop.

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use rlm_domain::message::{ContentPart, Message, ToolCall, ToolDefinition};
use rlm_domain::Result;

/// Token usage reported by the adapter for one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A provider-agnostic child completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

/// Per-call controls passed alongside the request.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub max_tokens: u32,
    /// Cancelled when the owning operation aborts or the child times out.
    pub cancel: CancellationToken,
}

/// A full model response.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: Vec<ContentPart>,
    pub usage: Usage,
}

impl Completion {
    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tool invocations requested by the model.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolUse { id, name, input } => Some(ToolCall {
                    call_id: id.clone(),
                    tool_name: name.clone(),
                    arguments: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Trait every model-call implementation must provide.
#[async_trait::async_trait]
pub trait ModelAdapter: Send + Sync {
    /// One-shot completion.
    async fn complete(
        &self,
        model: &str,
        request: CompletionRequest,
        options: CallOptions,
    ) -> Result<Completion>;

    /// Streaming completion, awaited to the same final shape.
    async fn stream(
        &self,
        model: &str,
        request: CompletionRequest,
        options: CallOptions,
    ) -> Result<Completion>;
}

/// The set of model identifiers the host knows about.
///
/// Used to validate `model` overrides before a child call; an unknown
/// name falls back to the configured default with a warning.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<Vec<String>>,
}

impl ModelRegistry {
    pub fn new(models: Vec<String>) -> Self {
        Self {
            models: RwLock::new(models),
        }
    }

    pub fn contains(&self, model: &str) -> bool {
        self.models.read().iter().any(|m| m == model)
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }

    pub fn replace(&self, models: Vec<String>) {
        *self.models.write() = models;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_text_joins_blocks() {
        let completion = Completion {
            content: vec![
                ContentPart::Text { text: "part one".into() },
                ContentPart::ToolUse {
                    id: "c1".into(),
                    name: "rlm_peek".into(),
                    input: serde_json::json!({"id": "rlm-obj-1"}),
                },
                ContentPart::Text { text: "part two".into() },
            ],
            usage: Usage::default(),
        };
        assert_eq!(completion.text(), "part one\npart two");
        let calls = completion.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "rlm_peek");
    }

    #[test]
    fn registry_membership() {
        let registry = ModelRegistry::new(vec!["alpha".into(), "beta".into()]);
        assert!(registry.contains("alpha"));
        assert!(!registry.contains("gamma"));
        assert!(!registry.is_empty());
        assert!(ModelRegistry::default().is_empty());
    }
}
