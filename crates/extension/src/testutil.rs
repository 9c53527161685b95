//! Shared fixtures for session-level tests.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use rlm_domain::Result;
use rlm_engine::adapter::{CallOptions, Completion, CompletionRequest, ModelAdapter, Usage};

use crate::host::{ContextUsage, HostContext};

pub(crate) struct MockHost {
    pub cwd: PathBuf,
    pub session: String,
    pub usage: Mutex<ContextUsage>,
    pub events: Mutex<Vec<(String, serde_json::Value)>>,
    pub notifications: Mutex<Vec<String>>,
    pub entries: Mutex<Vec<(String, serde_json::Value)>>,
    pub model_id: Option<String>,
    pub ui: bool,
    pub confirm_answer: bool,
}

impl MockHost {
    pub fn new(cwd: impl Into<PathBuf>, session: impl Into<String>) -> Self {
        Self {
            cwd: cwd.into(),
            session: session.into(),
            usage: Mutex::new(ContextUsage { tokens: None, context_window: 100_000 }),
            events: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            entries: Mutex::new(Vec::new()),
            model_id: Some("test-model".into()),
            ui: false,
            confirm_answer: true,
        }
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events.lock().iter().map(|(n, _)| n.clone()).collect()
    }
}

#[async_trait::async_trait]
impl HostContext for MockHost {
    fn cwd(&self) -> PathBuf {
        self.cwd.clone()
    }

    fn session_id(&self) -> String {
        self.session.clone()
    }

    fn has_ui(&self) -> bool {
        self.ui
    }

    fn context_usage(&self) -> ContextUsage {
        *self.usage.lock()
    }

    fn model(&self) -> Option<String> {
        self.model_id.clone()
    }

    fn known_models(&self) -> Vec<String> {
        self.model_id.iter().cloned().collect()
    }

    fn notify(&self, message: &str) {
        self.notifications.lock().push(message.to_owned());
    }

    async fn confirm(&self, _message: &str) -> bool {
        self.confirm_answer
    }

    fn emit_event(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        self.events.lock().push((name.to_owned(), payload));
        Ok(())
    }

    fn append_entry(&self, kind: &str, data: serde_json::Value) {
        self.entries.lock().push((kind.to_owned(), data));
    }
}

/// Answers every call by echoing the user message back.
pub(crate) struct EchoAdapter;

fn echo_completion(request: &CompletionRequest) -> Completion {
    let content = request
        .messages
        .first()
        .map(|m| m.content.extract_all_text())
        .unwrap_or_default();
    let text = serde_json::json!({
        "answer": content,
        "confidence": "high",
        "evidence": [],
    })
    .to_string();
    Completion {
        content: vec![rlm_domain::message::ContentPart::Text { text }],
        usage: Usage { input_tokens: 10, output_tokens: 5 },
    }
}

#[async_trait::async_trait]
impl ModelAdapter for EchoAdapter {
    async fn complete(
        &self,
        _model: &str,
        request: CompletionRequest,
        _options: CallOptions,
    ) -> Result<Completion> {
        Ok(echo_completion(&request))
    }

    async fn stream(
        &self,
        _model: &str,
        request: CompletionRequest,
        _options: CallOptions,
    ) -> Result<Completion> {
        Ok(echo_completion(&request))
    }
}

/// Never resolves; for cancellation paths.
pub(crate) struct HangingAdapter;

#[async_trait::async_trait]
impl ModelAdapter for HangingAdapter {
    async fn complete(
        &self,
        _model: &str,
        _request: CompletionRequest,
        _options: CallOptions,
    ) -> Result<Completion> {
        std::future::pending().await
    }

    async fn stream(
        &self,
        _model: &str,
        _request: CompletionRequest,
        _options: CallOptions,
    ) -> Result<Completion> {
        std::future::pending().await
    }
}
