//! Call tree: operations, call nodes, and cancellation handles.
//!
//! An operation is one top-level `rlm_query`/`rlm_batch` invocation; it
//! owns a cancellation token and a child-call budget. Call nodes form a
//! forest keyed by id; children listen to their operation's token, so an
//! operation-level cancel fans out to every in-flight descendant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Truncation applied to stored instruction previews.
const INSTRUCTIONS_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Running,
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Running => "running",
            CallStatus::Success => "success",
            CallStatus::Error => "error",
            CallStatus::Timeout => "timeout",
            CallStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::Running)
    }
}

/// One child model call in the tree.
#[derive(Debug, Clone, Serialize)]
pub struct CallNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub operation_id: String,
    pub depth: u32,
    pub model: String,
    /// Truncated instruction preview for inspection.
    pub instructions: String,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub children: Vec<String>,
}

impl CallNode {
    pub fn new(
        id: impl Into<String>,
        parent_id: Option<String>,
        operation_id: impl Into<String>,
        depth: u32,
        model: impl Into<String>,
        instructions: &str,
    ) -> Self {
        let preview: String = instructions.chars().take(INSTRUCTIONS_PREVIEW_CHARS).collect();
        Self {
            id: id.into(),
            parent_id,
            operation_id: operation_id.into(),
            depth,
            model: model.into(),
            instructions: preview,
            status: CallStatus::Running,
            started_at: Utc::now(),
            duration_ms: None,
            input_tokens: 0,
            output_tokens: 0,
            children: Vec::new(),
        }
    }
}

/// Partial update merged into a call node.
#[derive(Debug, Clone, Default)]
pub struct CallUpdate {
    pub status: Option<CallStatus>,
    pub duration_ms: Option<u64>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

struct OperationEntry {
    id: String,
    cancel: CancellationToken,
    root_call_id: Option<String>,
    child_calls: u32,
    estimated_cost: f64,
    actual_cost: f64,
    started_at: DateTime<Utc>,
}

/// Read-only view of an operation entry.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSnapshot {
    pub id: String,
    pub root_call_id: Option<String>,
    pub child_calls: u32,
    pub estimated_cost: f64,
    pub actual_cost: f64,
    pub started_at: DateTime<Utc>,
}

/// Nested snapshot of one subtree, for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct CallView {
    #[serde(flatten)]
    pub node: CallNode,
    pub nested: Vec<CallView>,
}

struct TreeInner {
    nodes: HashMap<String, CallNode>,
    roots: Vec<String>,
    ops: HashMap<String, OperationEntry>,
}

/// The session's call forest plus its operation ledger.
pub struct CallTree {
    inner: RwLock<TreeInner>,
    max_child_calls: AtomicU32,
}

impl CallTree {
    pub fn new(max_child_calls: u32) -> Self {
        Self {
            inner: RwLock::new(TreeInner {
                nodes: HashMap::new(),
                roots: Vec::new(),
                ops: HashMap::new(),
            }),
            max_child_calls: AtomicU32::new(max_child_calls),
        }
    }

    pub fn set_max_child_calls(&self, n: u32) {
        self.max_child_calls.store(n, Ordering::Release);
    }

    pub fn max_child_calls(&self) -> u32 {
        self.max_child_calls.load(Ordering::Acquire)
    }

    // ── Operations ────────────────────────────────────────────────

    /// Register a new operation; returns its id and cancellation handle.
    pub fn register_operation(&self, estimated_cost: f64) -> (String, CancellationToken) {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("rlm-op-{}", &hex[..8]);
        let cancel = CancellationToken::new();
        self.inner.write().ops.insert(
            id.clone(),
            OperationEntry {
                id: id.clone(),
                cancel: cancel.clone(),
                root_call_id: None,
                child_calls: 0,
                estimated_cost,
                actual_cost: 0.0,
                started_at: Utc::now(),
            },
        );
        (id, cancel)
    }

    /// Count one more child call against the operation's budget. Returns
    /// false once the cap is exceeded.
    pub fn increment_child_calls(&self, operation_id: &str) -> bool {
        let max = self.max_child_calls();
        let mut inner = self.inner.write();
        match inner.ops.get_mut(operation_id) {
            Some(op) => {
                op.child_calls += 1;
                op.child_calls <= max
            }
            None => false,
        }
    }

    pub fn abort_operation(&self, operation_id: &str) {
        if let Some(op) = self.inner.read().ops.get(operation_id) {
            op.cancel.cancel();
        }
    }

    /// Cancel every registered operation. Returns how many were signalled.
    pub fn abort_all(&self) -> usize {
        let inner = self.inner.read();
        for op in inner.ops.values() {
            op.cancel.cancel();
        }
        inner.ops.len()
    }

    pub fn add_actual_cost(&self, operation_id: &str, delta: f64) {
        if let Some(op) = self.inner.write().ops.get_mut(operation_id) {
            op.actual_cost += delta;
        }
    }

    pub fn operation_estimate(&self, operation_id: &str) -> Option<f64> {
        self.inner.read().ops.get(operation_id).map(|op| op.estimated_cost)
    }

    pub fn operation_actual(&self, operation_id: &str) -> Option<f64> {
        self.inner.read().ops.get(operation_id).map(|op| op.actual_cost)
    }

    /// The most recently started operation still registered.
    pub fn active_operation(&self) -> Option<OperationSnapshot> {
        let inner = self.inner.read();
        inner
            .ops
            .values()
            .max_by_key(|op| op.started_at)
            .map(snapshot_op)
    }

    pub fn operation_count(&self) -> usize {
        self.inner.read().ops.len()
    }

    /// Drop the operation entry. Its call nodes stay in the tree.
    pub fn complete_operation(&self, operation_id: &str) -> Option<OperationSnapshot> {
        self.inner
            .write()
            .ops
            .remove(operation_id)
            .map(|op| snapshot_op(&op))
    }

    // ── Call nodes ────────────────────────────────────────────────

    /// Attach a node to its parent's children (or the roots list) and,
    /// when the operation has no root yet, record it as the root call.
    pub fn register_call(&self, node: CallNode) {
        let mut inner = self.inner.write();
        let id = node.id.clone();
        match &node.parent_id {
            Some(parent) => match inner.nodes.get_mut(parent) {
                Some(p) => p.children.push(id.clone()),
                None => {
                    tracing::warn!(call = %id, parent = %parent, "parent call not found; treating as root");
                    inner.roots.push(id.clone());
                }
            },
            None => inner.roots.push(id.clone()),
        }
        if let Some(op) = inner.ops.get_mut(&node.operation_id) {
            if op.root_call_id.is_none() {
                op.root_call_id = Some(id.clone());
            }
        }
        inner.nodes.insert(id, node);
    }

    pub fn update_call(&self, id: &str, update: CallUpdate) {
        let mut inner = self.inner.write();
        let Some(node) = inner.nodes.get_mut(id) else {
            tracing::warn!(call = %id, "update for unknown call node");
            return;
        };
        if let Some(status) = update.status {
            node.status = status;
        }
        if let Some(duration) = update.duration_ms {
            node.duration_ms = Some(duration);
        }
        if let Some(tokens) = update.input_tokens {
            node.input_tokens = tokens;
        }
        if let Some(tokens) = update.output_tokens {
            node.output_tokens = tokens;
        }
    }

    pub fn get_call(&self, id: &str) -> Option<CallNode> {
        self.inner.read().nodes.get(id).cloned()
    }

    /// All running nodes, depth-first from the roots.
    pub fn get_active(&self) -> Vec<CallNode> {
        let inner = self.inner.read();
        let mut active = Vec::new();
        let mut stack: Vec<&String> = inner.roots.iter().rev().collect();
        while let Some(id) = stack.pop() {
            if let Some(node) = inner.nodes.get(id) {
                if node.status == CallStatus::Running {
                    active.push(node.clone());
                }
                stack.extend(node.children.iter().rev());
            }
        }
        active
    }

    /// Maximum depth among running nodes (0 when idle).
    pub fn max_active_depth(&self) -> u32 {
        self.get_active().iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Nested snapshot of the whole forest.
    pub fn snapshot(&self) -> Vec<CallView> {
        let inner = self.inner.read();
        fn build(inner: &TreeInner, id: &str) -> Option<CallView> {
            let node = inner.nodes.get(id)?.clone();
            let nested = node
                .children
                .iter()
                .filter_map(|c| build(inner, c))
                .collect();
            Some(CallView { node, nested })
        }
        inner
            .roots
            .iter()
            .filter_map(|id| build(&inner, id))
            .collect()
    }
}

fn snapshot_op(op: &OperationEntry) -> OperationSnapshot {
    OperationSnapshot {
        id: op.id.clone(),
        root_call_id: op.root_call_id.clone(),
        child_calls: op.child_calls,
        estimated_cost: op.estimated_cost,
        actual_cost: op.actual_cost,
        started_at: op.started_at,
    }
}
