//! Child-call lifecycle: budget checks, model resolution, context
//! assembly, retry/backoff, and the child tool surface.
//!
//! `query` runs one child call over joined targets; `batch` fans one call
//! per target through the bounded limiter. Child tool handlers read the
//! same store and warm tracker as the top-level tools, and the recursive
//! `rlm_query` handler re-enters this engine one level deeper.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use rlm_domain::child::ChildResult;
use rlm_domain::config::RlmConfig;
use rlm_domain::message::{Message, ToolDefinition};
use rlm_domain::record::{ContentKind, NewRecord, RecordSource};
use rlm_store::trajectory::{TrajectoryRecord, TrajectoryWriter};
use rlm_store::{ExternalStore, WarmTracker};

use crate::adapter::{ModelAdapter, ModelRegistry};
use crate::agent::{self, LoopEnd};
use crate::calltree::{CallNode, CallStatus, CallTree, CallUpdate};
use crate::cost::CostEstimator;
use crate::{limiter, prompt, search};

/// Separator between target objects in the child's user message.
const TARGET_SEPARATOR: &str = "\n---\n";
/// Total attempts per child call when rate limited.
const RATE_LIMIT_ATTEMPTS: u32 = 3;
/// Default peek window for child-level `rlm_peek`.
const DEFAULT_PEEK_LENGTH: usize = 2000;

/// Arguments to one child call.
#[derive(Debug, Clone)]
pub struct QueryArgs {
    pub instructions: String,
    pub target_ids: Vec<String>,
    pub parent_call_id: Option<String>,
    pub depth: u32,
    pub operation_id: String,
    pub operation_cancel: CancellationToken,
    /// The host session's resolved model, if any.
    pub host_model: Option<String>,
    pub model_override: Option<String>,
}

/// Arguments to a parallel batch (one child call per target).
#[derive(Debug, Clone)]
pub struct BatchArgs {
    pub instructions: String,
    pub target_ids: Vec<String>,
    pub depth: u32,
    pub operation_id: String,
    pub operation_cancel: CancellationToken,
    pub host_model: Option<String>,
    pub model_override: Option<String>,
}

/// Context threaded through a child loop into its tool handlers.
pub(crate) struct ChildScope {
    pub operation_id: String,
    pub operation_cancel: CancellationToken,
    pub depth: u32,
    pub call_id: String,
    pub host_model: Option<String>,
    pub can_recurse: bool,
}

pub struct RecursiveEngine {
    store: Arc<ExternalStore>,
    warm: Arc<WarmTracker>,
    tree: Arc<CallTree>,
    adapter: Arc<dyn ModelAdapter>,
    models: Arc<ModelRegistry>,
    config: Arc<RwLock<RlmConfig>>,
    trajectory: TrajectoryWriter,
}

impl RecursiveEngine {
    pub fn new(
        store: Arc<ExternalStore>,
        warm: Arc<WarmTracker>,
        tree: Arc<CallTree>,
        adapter: Arc<dyn ModelAdapter>,
        models: Arc<ModelRegistry>,
        config: Arc<RwLock<RlmConfig>>,
    ) -> Self {
        let trajectory = TrajectoryWriter::new(store.dir());
        Self {
            store,
            warm,
            tree,
            adapter,
            models,
            config,
            trajectory,
        }
    }

    pub fn store(&self) -> &Arc<ExternalStore> {
        &self.store
    }

    pub fn tree(&self) -> &Arc<CallTree> {
        &self.tree
    }

    pub(crate) fn adapter(&self) -> &dyn ModelAdapter {
        self.adapter.as_ref()
    }

    pub(crate) fn child_max_tokens(&self) -> u32 {
        self.config.read().child_max_tokens
    }

    // ── query ─────────────────────────────────────────────────────

    /// One child call over the joined targets. Never fails: every error
    /// path becomes a structured low-confidence result.
    pub async fn query(&self, args: QueryArgs) -> ChildResult {
        let cfg = self.config.read().clone();

        if args.depth > cfg.max_depth {
            return ChildResult::error(format!(
                "recursion depth {} exceeds the maximum of {}",
                args.depth, cfg.max_depth
            ));
        }
        if !self.tree.increment_child_calls(&args.operation_id) {
            return ChildResult::error(format!(
                "child call budget of {} exhausted for this operation",
                self.tree.max_child_calls()
            ));
        }

        let call_id = mint_call_id();
        let resolved = self.resolve_model(&args.model_override, &cfg, &args.host_model);
        let model_label = resolved.clone().unwrap_or_else(|| "unresolved".to_owned());
        self.tree.register_call(CallNode::new(
            &call_id,
            args.parent_call_id.clone(),
            &args.operation_id,
            args.depth,
            &model_label,
            &args.instructions,
        ));
        let Some(model) = resolved else {
            self.tree.update_call(
                &call_id,
                CallUpdate {
                    status: Some(CallStatus::Error),
                    duration_ms: Some(0),
                    ..Default::default()
                },
            );
            return ChildResult::error("no model is available for child calls");
        };

        // Child context: joined target contents, one user message.
        let sections: Vec<String> = args
            .target_ids
            .iter()
            .map(|id| match self.store.get(id) {
                Some(record) => record.content,
                None => format!("[Object {id} not found]"),
            })
            .collect();
        let user = Message::user(sections.join(TARGET_SEPARATOR));

        let can_recurse = args.depth + 1 < cfg.max_depth;
        let system_prompt =
            prompt::child_system_prompt(&args.instructions, args.depth, cfg.max_depth, can_recurse);
        let tools = child_tool_definitions(can_recurse);
        let scope = ChildScope {
            operation_id: args.operation_id.clone(),
            operation_cancel: args.operation_cancel.clone(),
            depth: args.depth,
            call_id: call_id.clone(),
            host_model: args.host_model.clone(),
            can_recurse,
        };

        let started = tokio::time::Instant::now();
        let mut attempt = 1u32;
        let loop_result = loop {
            // Fresh timer and handle per attempt; messages and tools are reused.
            let child_cancel = args.operation_cancel.child_token();
            let deadline =
                tokio::time::Instant::now() + Duration::from_secs(cfg.child_timeout_sec);
            let result = agent::run_child_loop(
                self,
                &scope,
                &model,
                &system_prompt,
                vec![user.clone()],
                tools.clone(),
                child_cancel,
                deadline,
            )
            .await;
            match result {
                Err(e) if e.is_rate_limited() && attempt < RATE_LIMIT_ATTEMPTS => {
                    let delay = Duration::from_secs(1u64 << (attempt - 1));
                    tracing::warn!(
                        call = %call_id,
                        attempt,
                        delay_s = delay.as_secs(),
                        "rate limited; retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => break other,
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, result, input_tokens, output_tokens) = match loop_result {
            Ok(outcome) => match outcome.end {
                LoopEnd::Completed | LoopEnd::MaxTurns => (
                    CallStatus::Success,
                    ChildResult::parse(&outcome.text),
                    outcome.input_tokens,
                    outcome.output_tokens,
                ),
                LoopEnd::Aborted => {
                    let status = if args.operation_cancel.is_cancelled() {
                        CallStatus::Cancelled
                    } else {
                        CallStatus::Timeout
                    };
                    (
                        status,
                        ChildResult::error(match status {
                            CallStatus::Cancelled => "operation cancelled".to_owned(),
                            _ => format!("child call timed out after {}s", cfg.child_timeout_sec),
                        }),
                        outcome.input_tokens,
                        outcome.output_tokens,
                    )
                }
                LoopEnd::DeadlineExceeded => (
                    CallStatus::Timeout,
                    ChildResult::error(format!(
                        "child call timed out after {}s",
                        cfg.child_timeout_sec
                    )),
                    outcome.input_tokens,
                    outcome.output_tokens,
                ),
            },
            Err(e) => (
                CallStatus::Error,
                ChildResult::error(format!("child call failed: {e}")),
                0,
                0,
            ),
        };

        self.tree.update_call(
            &call_id,
            CallUpdate {
                status: Some(status),
                duration_ms: Some(duration_ms),
                input_tokens: Some(input_tokens),
                output_tokens: Some(output_tokens),
            },
        );
        let cost = CostEstimator::new(cfg.pricing.clone()).add_call_cost(
            input_tokens,
            output_tokens,
            &model,
        );
        self.tree.add_actual_cost(&args.operation_id, cost);

        // Top-level answers become store records of their own.
        if status == CallStatus::Success && args.depth == 1 && !result.answer.is_empty() {
            let snippet: String = args.instructions.chars().take(60).collect();
            self.store.add(NewRecord {
                kind: ContentKind::Artifact,
                description: format!("child result: {}", snippet.trim()),
                token_estimate: (result.answer.chars().count() as u64).div_ceil(4),
                source: RecordSource::ChildResult { call_id: call_id.clone() },
                content: result.answer.clone(),
            });
        }
        self.warm
            .mark_warm(args.target_ids.iter().cloned(), cfg.warm_turns);
        self.trajectory.append(
            self.store.queue(),
            TrajectoryRecord::ChildCall {
                operation_id: args.operation_id.clone(),
                call_id,
                parent_call_id: args.parent_call_id.clone(),
                depth: args.depth,
                model,
                status: status.as_str().to_owned(),
                input_tokens,
                output_tokens,
                duration_ms,
            },
        );
        result
    }

    // ── batch ─────────────────────────────────────────────────────

    /// One child call per target through the bounded limiter, preserving
    /// target order. Per-task failures come back as structured results.
    pub async fn batch(&self, args: BatchArgs) -> Vec<ChildResult> {
        let max_concurrency = self.config.read().max_concurrency;
        let BatchArgs {
            instructions,
            target_ids,
            depth,
            operation_id,
            operation_cancel,
            host_model,
            model_override,
        } = args;

        let mapped = limiter::bounded_map(target_ids, max_concurrency, |_, target| {
            let query_args = QueryArgs {
                instructions: instructions.clone(),
                target_ids: vec![target],
                parent_call_id: None,
                depth,
                operation_id: operation_id.clone(),
                operation_cancel: operation_cancel.clone(),
                host_model: host_model.clone(),
                model_override: model_override.clone(),
            };
            async move { Ok(self.query(query_args).await) }
        })
        .await;

        // query never errs, so this arm is unreachable in practice.
        mapped.unwrap_or_else(|e| vec![ChildResult::error(format!("batch failed: {e}"))])
    }

    // ── Model resolution ──────────────────────────────────────────

    /// `override ?? config.childModel ?? host model`, checking named
    /// overrides against the registry and warning on fallback.
    fn resolve_model(
        &self,
        model_override: &Option<String>,
        cfg: &RlmConfig,
        host_model: &Option<String>,
    ) -> Option<String> {
        for (candidate, what) in [
            (model_override.as_ref(), "override"),
            (cfg.child_model.as_ref(), "childModel"),
        ] {
            if let Some(name) = candidate {
                if self.models.is_empty() || self.models.contains(name) {
                    return Some(name.clone());
                }
                tracing::warn!(model = %name, source = what, "model not in registry; falling back");
            }
        }
        host_model.clone()
    }

    // ── Child tool surface ────────────────────────────────────────

    /// Dispatch one child tool call. Returns `(rendered output, is_error)`.
    /// Boxed so the `rlm_query` → engine → loop → dispatch cycle has a
    /// finite future type.
    pub(crate) fn dispatch_child_tool<'a>(
        &'a self,
        scope: &'a ChildScope,
        name: &'a str,
        args: &'a serde_json::Value,
    ) -> BoxFuture<'a, (String, bool)> {
        Box::pin(async move {
            match name {
                "rlm_peek" => self.child_peek(args),
                "rlm_search" => self.child_search(args).await,
                "rlm_query" if scope.can_recurse => self.child_query(scope, args).await,
                other => {
                    let mut available = vec!["rlm_peek", "rlm_search"];
                    if scope.can_recurse {
                        available.push("rlm_query");
                    }
                    (
                        format!(
                            "Unknown tool '{other}'. Available tools: {}",
                            available.join(", ")
                        ),
                        true,
                    )
                }
            }
        })
    }

    fn child_peek(&self, args: &serde_json::Value) -> (String, bool) {
        #[derive(Deserialize)]
        struct PeekArgs {
            id: String,
            #[serde(default)]
            offset: usize,
            #[serde(default = "default_peek_length")]
            length: usize,
        }
        let parsed: PeekArgs = match serde_json::from_value(args.clone()) {
            Ok(p) => p,
            Err(e) => return (format!("invalid rlm_peek arguments: {e}"), true),
        };
        let Some(record) = self.store.get(&parsed.id) else {
            return (format!("Object {} not found", parsed.id), true);
        };
        let warm_turns = self.config.read().warm_turns;
        self.warm.mark_warm([parsed.id.clone()], warm_turns);
        (
            peek_slice(&record.content, parsed.offset, parsed.length.max(1), &parsed.id),
            false,
        )
    }

    async fn child_search(&self, args: &serde_json::Value) -> (String, bool) {
        #[derive(Deserialize)]
        struct SearchArgs {
            pattern: String,
            #[serde(default)]
            scope: Option<ScopeArg>,
        }
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum ScopeArg {
            All(String),
            Ids(Vec<String>),
        }
        let parsed: SearchArgs = match serde_json::from_value(args.clone()) {
            Ok(p) => p,
            Err(e) => return (format!("invalid rlm_search arguments: {e}"), true),
        };
        let scope_ids = match parsed.scope {
            Some(ScopeArg::Ids(ids)) => Some(ids),
            _ => None,
        };
        let matches = search::search_store(&self.store, scope_ids.as_deref(), &parsed.pattern).await;
        let warm_turns = self.config.read().warm_turns;
        self.warm.mark_warm(
            matches.iter().map(|m| m.object_id.clone()),
            warm_turns,
        );
        match serde_json::to_string_pretty(&matches) {
            Ok(json) => (json, false),
            Err(e) => (format!("failed to render search results: {e}"), true),
        }
    }

    async fn child_query(&self, scope: &ChildScope, args: &serde_json::Value) -> (String, bool) {
        #[derive(Deserialize)]
        struct QueryToolArgs {
            instructions: String,
            target: TargetArg,
            #[serde(default)]
            model: Option<String>,
        }
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum TargetArg {
            One(String),
            Many(Vec<String>),
        }
        let parsed: QueryToolArgs = match serde_json::from_value(args.clone()) {
            Ok(p) => p,
            Err(e) => return (format!("invalid rlm_query arguments: {e}"), true),
        };
        let target_ids = match parsed.target {
            TargetArg::One(id) => vec![id],
            TargetArg::Many(ids) => ids,
        };
        let result = self
            .query(QueryArgs {
                instructions: parsed.instructions,
                target_ids,
                parent_call_id: Some(scope.call_id.clone()),
                depth: scope.depth + 1,
                operation_id: scope.operation_id.clone(),
                operation_cancel: scope.operation_cancel.clone(),
                host_model: scope.host_model.clone(),
                model_override: parsed.model,
            })
            .await;
        match serde_json::to_string_pretty(&result) {
            Ok(json) => (json, false),
            Err(e) => (format!("failed to render child result: {e}"), true),
        }
    }
}

fn default_peek_length() -> usize {
    DEFAULT_PEEK_LENGTH
}

fn mint_call_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("rlm-call-{}", &hex[..8])
}

/// Character-addressed window over an object's content, with a
/// continuation hint when more remains.
pub fn peek_slice(content: &str, offset: usize, length: usize, id: &str) -> String {
    let total = content.chars().count();
    let slice: String = content.chars().skip(offset).take(length).collect();
    let end = offset + slice.chars().count();
    if end < total {
        format!(
            "{slice}\n\n[{} more characters; continue with rlm_peek(\"{id}\", offset={end})]",
            total - end
        )
    } else {
        slice
    }
}

/// Tool schemas exposed to child calls.
pub fn child_tool_definitions(can_recurse: bool) -> Vec<ToolDefinition> {
    let mut defs = vec![
        ToolDefinition {
            name: "rlm_peek".into(),
            description: "View a window of a stored object's content.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string", "description": "Object id (rlm-obj-...)" },
                    "offset": { "type": "integer", "minimum": 0, "description": "Start character (default 0)" },
                    "length": { "type": "integer", "minimum": 1, "description": "Characters to return (default 2000)" }
                },
                "required": ["id"]
            }),
        },
        ToolDefinition {
            name: "rlm_search".into(),
            description: "Search stored objects for a substring or /regex/ pattern.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Substring, or /body/flags regex" },
                    "scope": {
                        "description": "\"all\" or a list of object ids",
                        "oneOf": [
                            { "type": "string" },
                            { "type": "array", "items": { "type": "string" } }
                        ]
                    }
                },
                "required": ["pattern"]
            }),
        },
    ];
    if can_recurse {
        defs.push(ToolDefinition {
            name: "rlm_query".into(),
            description: "Delegate a narrower question about stored objects to a deeper sub-agent.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "instructions": { "type": "string", "description": "What the sub-agent should determine" },
                    "target": {
                        "description": "Object id or list of ids",
                        "oneOf": [
                            { "type": "string" },
                            { "type": "array", "items": { "type": "string" } }
                        ]
                    },
                    "model": { "type": "string", "description": "Optional model override" }
                },
                "required": ["instructions", "target"]
            }),
        });
    }
    defs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{CallOptions, Completion, CompletionRequest, Usage};
    use rlm_domain::child::Confidence;
    use rlm_domain::message::ContentPart;
    use rlm_domain::record::{ContentKind, NewRecord, RecordSource};
    use rlm_domain::{Error, Result};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn text_completion(text: &str) -> Completion {
        Completion {
            content: vec![ContentPart::Text { text: text.into() }],
            usage: Usage { input_tokens: 100, output_tokens: 20 },
        }
    }

    fn answer_json(answer: &str) -> String {
        serde_json::json!({
            "answer": answer,
            "confidence": "high",
            "evidence": [],
        })
        .to_string()
    }

    /// Pops scripted responses; returns a plain answer when exhausted.
    struct ScriptedAdapter {
        complete_responses: parking_lot::Mutex<VecDeque<Result<Completion>>>,
        stream_responses: parking_lot::Mutex<VecDeque<Result<Completion>>>,
        complete_calls: AtomicUsize,
        stream_calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        fn new(complete: Vec<Result<Completion>>, stream: Vec<Result<Completion>>) -> Self {
            Self {
                complete_responses: parking_lot::Mutex::new(complete.into()),
                stream_responses: parking_lot::Mutex::new(stream.into()),
                complete_calls: AtomicUsize::new(0),
                stream_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl ModelAdapter for ScriptedAdapter {
        async fn complete(
            &self,
            _model: &str,
            _request: CompletionRequest,
            _options: CallOptions,
        ) -> Result<Completion> {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            self.complete_responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(text_completion(&answer_json("scripted default"))))
        }

        async fn stream(
            &self,
            _model: &str,
            _request: CompletionRequest,
            _options: CallOptions,
        ) -> Result<Completion> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            self.stream_responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(text_completion(&answer_json("streamed default"))))
        }
    }

    /// Echoes the user message back as the answer.
    struct EchoAdapter;

    #[async_trait::async_trait]
    impl ModelAdapter for EchoAdapter {
        async fn complete(
            &self,
            _model: &str,
            request: CompletionRequest,
            _options: CallOptions,
        ) -> Result<Completion> {
            let content = request.messages[0].content.extract_all_text();
            Ok(text_completion(&answer_json(&content)))
        }

        async fn stream(
            &self,
            model: &str,
            request: CompletionRequest,
            options: CallOptions,
        ) -> Result<Completion> {
            self.complete(model, request, options).await
        }
    }

    /// Never resolves; exercises cancellation and timeouts.
    struct HangingAdapter;

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

    struct Fixture {
        engine: RecursiveEngine,
        store: Arc<ExternalStore>,
        tree: Arc<CallTree>,
        _tmp: TempDir,
    }

    async fn fixture(adapter: Arc<dyn ModelAdapter>, cfg: RlmConfig) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ExternalStore::new(tmp.path(), "sess-test"));
        store.initialize().await.unwrap();
        let tree = Arc::new(CallTree::new(cfg.max_child_calls));
        let engine = RecursiveEngine::new(
            store.clone(),
            Arc::new(WarmTracker::new()),
            tree.clone(),
            adapter,
            Arc::new(ModelRegistry::new(vec!["test-model".into()])),
            Arc::new(RwLock::new(cfg)),
        );
        Fixture { engine, store, tree, _tmp: tmp }
    }

    fn add_object(store: &ExternalStore, content: &str) -> String {
        store
            .add(NewRecord {
                kind: ContentKind::File,
                description: "test object".into(),
                token_estimate: 10,
                source: RecordSource::Ingested { path: "/tmp/x".into() },
                content: content.into(),
            })
            .id
    }

    fn query_args(fx: &Fixture, targets: Vec<String>, depth: u32) -> (QueryArgs, CancellationToken) {
        let (operation_id, cancel) = fx.tree.register_operation(0.0);
        (
            QueryArgs {
                instructions: "answer".into(),
                target_ids: targets,
                parent_call_id: None,
                depth,
                operation_id,
                operation_cancel: cancel.clone(),
                host_model: Some("test-model".into()),
                model_override: None,
            },
            cancel,
        )
    }

    #[tokio::test]
    async fn query_returns_parsed_result_and_records_the_call() {
        let fx = fixture(Arc::new(EchoAdapter), RlmConfig::default()).await;
        let id = add_object(&fx.store, "the port is 8080");
        let (args, _cancel) = query_args(&fx, vec![id.clone()], 1);
        let op = args.operation_id.clone();

        let result = fx.engine.query(args).await;
        assert_eq!(result.confidence, Confidence::High);
        assert!(result.answer.contains("the port is 8080"));

        let active = fx.tree.get_active();
        assert!(active.is_empty());
        let snapshot = fx.tree.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].node.status, CallStatus::Success);
        assert_eq!(snapshot[0].node.input_tokens, 100);
        assert!(fx.tree.operation_actual(&op).is_some());
    }

    #[tokio::test]
    async fn successful_top_level_answers_are_captured() {
        let fx = fixture(Arc::new(EchoAdapter), RlmConfig::default()).await;
        let id = add_object(&fx.store, "captured body");
        let before = fx.store.object_count();
        let (args, _cancel) = query_args(&fx, vec![id], 1);

        fx.engine.query(args).await;
        assert_eq!(fx.store.object_count(), before + 1);
        let index = fx.store.full_index();
        let captured = index.entries.last().unwrap();
        assert_eq!(captured.kind, ContentKind::Artifact);
        assert!(captured.description.starts_with("child result:"));
        let record = fx.store.get(&captured.id).unwrap();
        assert!(matches!(record.source, RecordSource::ChildResult { .. }));
        assert!(record.content.contains("captured body"));
    }

    #[tokio::test]
    async fn missing_targets_become_placeholders() {
        let fx = fixture(Arc::new(EchoAdapter), RlmConfig::default()).await;
        let (args, _cancel) = query_args(&fx, vec!["rlm-obj-missing".into()], 1);
        let result = fx.engine.query(args).await;
        assert!(result.answer.contains("[Object rlm-obj-missing not found]"));
    }

    #[tokio::test]
    async fn depth_beyond_the_ceiling_is_rejected_without_a_call() {
        let fx = fixture(Arc::new(HangingAdapter), RlmConfig::default()).await;
        let (args, _cancel) = query_args(&fx, vec![], 3);
        let result = fx.engine.query(args).await;
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.answer.contains("depth"));
    }

    #[tokio::test]
    async fn child_call_budget_is_enforced() {
        let mut cfg = RlmConfig::default();
        cfg.max_child_calls = 1;
        let fx = fixture(Arc::new(EchoAdapter), cfg).await;
        let id = add_object(&fx.store, "content");
        let (args, cancel) = query_args(&fx, vec![id.clone()], 1);
        let op = args.operation_id.clone();

        let first = fx.engine.query(args).await;
        assert_eq!(first.confidence, Confidence::High);

        let second = fx
            .engine
            .query(QueryArgs {
                instructions: "again".into(),
                target_ids: vec![id],
                parent_call_id: None,
                depth: 1,
                operation_id: op,
                operation_cancel: cancel,
                host_model: Some("test-model".into()),
                model_override: None,
            })
            .await;
        assert!(second.answer.contains("budget"));
    }

    #[tokio::test]
    async fn query_marks_targets_warm() {
        let cfg = RlmConfig::default();
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ExternalStore::new(tmp.path(), "sess"));
        store.initialize().await.unwrap();
        let warm = Arc::new(WarmTracker::new());
        let tree = Arc::new(CallTree::new(cfg.max_child_calls));
        let engine = RecursiveEngine::new(
            store.clone(),
            warm.clone(),
            tree.clone(),
            Arc::new(EchoAdapter),
            Arc::new(ModelRegistry::default()),
            Arc::new(RwLock::new(cfg)),
        );
        let id = add_object(&store, "abc");
        let (op, cancel) = tree.register_operation(0.0);
        engine
            .query(QueryArgs {
                instructions: "x".into(),
                target_ids: vec![id.clone()],
                parent_call_id: None,
                depth: 1,
                operation_id: op,
                operation_cancel: cancel,
                host_model: Some("m".into()),
                model_override: None,
            })
            .await;
        assert!(warm.is_warm(&id));
    }

    #[tokio::test]
    async fn no_model_anywhere_is_a_structured_error() {
        let fx = fixture(Arc::new(EchoAdapter), RlmConfig::default()).await;
        let (mut args, _cancel) = query_args(&fx, vec![], 1);
        args.host_model = None;
        let result = fx.engine.query(args).await;
        assert!(result.answer.contains("no model"));
        assert_eq!(fx.tree.snapshot()[0].node.status, CallStatus::Error);
    }

    #[tokio::test]
    async fn unknown_override_falls_back_to_host_model() {
        let fx = fixture(Arc::new(EchoAdapter), RlmConfig::default()).await;
        let id = add_object(&fx.store, "fallback check");
        let (mut args, _cancel) = query_args(&fx, vec![id], 1);
        args.model_override = Some("not-in-registry".into());
        let result = fx.engine.query(args).await;
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(fx.tree.snapshot()[0].node.model, "test-model");
    }

    #[tokio::test]
    async fn cancelling_the_operation_resolves_the_call_as_cancelled() {
        let fx = fixture(Arc::new(HangingAdapter), RlmConfig::default()).await;
        let id = add_object(&fx.store, "content");
        let (args, cancel) = query_args(&fx, vec![id], 1);

        let cancel_after = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_after.cancel();
        });
        let result = fx.engine.query(args).await;
        assert!(result.answer.contains("cancelled"));
        assert_eq!(fx.tree.snapshot()[0].node.status, CallStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_resolves_the_call_as_timeout() {
        let mut cfg = RlmConfig::default();
        cfg.child_timeout_sec = 1;
        let fx = fixture(Arc::new(HangingAdapter), cfg).await;
        let id = add_object(&fx.store, "content");
        let (args, _cancel) = query_args(&fx, vec![id], 1);

        let result = fx.engine.query(args).await;
        assert!(result.answer.contains("timed out"));
        assert_eq!(fx.tree.snapshot()[0].node.status, CallStatus::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_retry_with_backoff() {
        let adapter = Arc::new(ScriptedAdapter::new(
            vec![
                Err(Error::RateLimited("busy".into())),
                Err(Error::RateLimited("busy".into())),
                Ok(text_completion(&answer_json("third time lucky"))),
            ],
            vec![],
        ));
        let fx = fixture(adapter.clone(), RlmConfig::default()).await;
        let id = add_object(&fx.store, "content");
        let (args, _cancel) = query_args(&fx, vec![id], 1);

        let result = fx.engine.query(args).await;
        assert_eq!(result.answer, "third time lucky");
        assert_eq!(adapter.complete_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_an_error_result() {
        let adapter = Arc::new(ScriptedAdapter::new(
            vec![
                Err(Error::RateLimited("busy".into())),
                Err(Error::RateLimited("busy".into())),
                Err(Error::RateLimited("busy".into())),
            ],
            vec![],
        ));
        let fx = fixture(adapter.clone(), RlmConfig::default()).await;
        let id = add_object(&fx.store, "content");
        let (args, _cancel) = query_args(&fx, vec![id], 1);

        let result = fx.engine.query(args).await;
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.answer.contains("failed"));
        assert_eq!(adapter.complete_calls.load(Ordering::SeqCst), 3);
        assert_eq!(fx.tree.snapshot()[0].node.status, CallStatus::Error);
    }

    #[tokio::test]
    async fn unsupported_complete_switches_to_stream() {
        let adapter = Arc::new(ScriptedAdapter::new(
            vec![Err(Error::Unsupported("complete".into()))],
            vec![Ok(text_completion(&answer_json("via stream")))],
        ));
        let fx = fixture(adapter.clone(), RlmConfig::default()).await;
        let id = add_object(&fx.store, "content");
        let (args, _cancel) = query_args(&fx, vec![id], 1);

        let result = fx.engine.query(args).await;
        assert_eq!(result.answer, "via stream");
        assert_eq!(adapter.stream_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tool_calls_are_dispatched_and_the_loop_continues() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ExternalStore::new(tmp.path(), "sess"));
        store.initialize().await.unwrap();
        let target = add_object(&store, "target content");
        let peek_target = add_object(&store, "peeked content");

        // Turn 1: the child peeks another object; turn 2: it answers.
        let tool_turn = Completion {
            content: vec![ContentPart::ToolUse {
                id: "tc-1".into(),
                name: "rlm_peek".into(),
                input: serde_json::json!({ "id": peek_target }),
            }],
            usage: Usage { input_tokens: 50, output_tokens: 10 },
        };
        let adapter = Arc::new(ScriptedAdapter::new(
            vec![Ok(tool_turn), Ok(text_completion(&answer_json("done")))],
            vec![],
        ));
        let warm = Arc::new(WarmTracker::new());
        let tree = Arc::new(CallTree::new(50));
        let engine = RecursiveEngine::new(
            store.clone(),
            warm.clone(),
            tree.clone(),
            adapter.clone(),
            Arc::new(ModelRegistry::default()),
            Arc::new(RwLock::new(RlmConfig::default())),
        );
        let (operation_id, cancel) = tree.register_operation(0.0);

        let result = engine
            .query(QueryArgs {
                instructions: "inspect".into(),
                target_ids: vec![target],
                parent_call_id: None,
                depth: 1,
                operation_id,
                operation_cancel: cancel,
                host_model: Some("test-model".into()),
                model_override: None,
            })
            .await;
        assert_eq!(result.answer, "done");
        assert_eq!(adapter.complete_calls.load(Ordering::SeqCst), 2);
        // The peeked object is warm; usage accumulated across both turns.
        assert!(warm.is_warm(&peek_target));
        assert_eq!(tree.snapshot()[0].node.input_tokens, 150);
    }

    #[tokio::test]
    async fn unknown_child_tool_preserves_the_loop() {
        let tool_turn = Completion {
            content: vec![ContentPart::ToolUse {
                id: "tc-1".into(),
                name: "rlm_teleport".into(),
                input: serde_json::json!({}),
            }],
            usage: Usage::default(),
        };
        let adapter = Arc::new(ScriptedAdapter::new(
            vec![Ok(tool_turn), Ok(text_completion(&answer_json("recovered")))],
            vec![],
        ));
        let fx = fixture(adapter.clone(), RlmConfig::default()).await;
        let id = add_object(&fx.store, "content");
        let (args, _cancel) = query_args(&fx, vec![id], 1);

        let result = fx.engine.query(args).await;
        assert_eq!(result.answer, "recovered");
        assert_eq!(adapter.complete_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batch_preserves_target_order() {
        let fx = fixture(Arc::new(EchoAdapter), RlmConfig::default()).await;
        let ids: Vec<String> = ["alpha content", "beta content", "gamma content"]
            .iter()
            .map(|c| add_object(&fx.store, c))
            .collect();
        let (operation_id, cancel) = fx.tree.register_operation(0.0);

        let results = fx
            .engine
            .batch(BatchArgs {
                instructions: "echo".into(),
                target_ids: ids,
                depth: 1,
                operation_id,
                operation_cancel: cancel,
                host_model: Some("test-model".into()),
                model_override: None,
            })
            .await;
        assert_eq!(results.len(), 3);
        assert!(results[0].answer.contains("alpha"));
        assert!(results[1].answer.contains("beta"));
        assert!(results[2].answer.contains("gamma"));
    }

    #[test]
    fn peek_slice_windows_and_hints() {
        let content: String = ('a'..='z').collect();
        let full = peek_slice(&content, 0, 100, "rlm-obj-1");
        assert_eq!(full, content);

        let windowed = peek_slice(&content, 0, 10, "rlm-obj-1");
        assert!(windowed.starts_with("abcdefghij"));
        assert!(windowed.contains("16 more characters"));
        assert!(windowed.contains("offset=10"));

        let tail = peek_slice(&content, 20, 10, "rlm-obj-1");
        assert!(tail.starts_with("uvwxyz"));
        assert!(!tail.contains("more characters"));
    }

    #[test]
    fn child_tools_gate_recursion() {
        let leaf = child_tool_definitions(false);
        assert_eq!(leaf.len(), 2);
        let recursive = child_tool_definitions(true);
        assert_eq!(recursive.len(), 3);
        assert!(recursive.iter().any(|d| d.name == "rlm_query"));
    }
}
