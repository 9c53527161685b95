use serde::Serialize;
use serde_json::{json, Value};

/// Inter-extension events published on the host bus.
///
/// Payload keys use the host-facing camelCase spellings; emission failures
/// are logged by the caller and never fatal.
#[derive(Debug, Clone, Serialize)]
pub enum RlmEvent {
    Externalize {
        object_ids: Vec<String>,
        count: usize,
        tokens_saved: u64,
    },
    QueryStart { operation_id: String, targets: usize },
    QueryEnd { operation_id: String, status: String },
    BatchStart { operation_id: String, targets: usize },
    BatchEnd { operation_id: String, completed: usize },
    Search { pattern: String, matches: usize },
    Ingest { files: usize, bytes: u64 },
    Toggle { enabled: bool },
    Initialized { session_id: String, objects: usize },
}

impl RlmEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RlmEvent::Externalize { .. } => "rlm:externalize",
            RlmEvent::QueryStart { .. } => "rlm:query:start",
            RlmEvent::QueryEnd { .. } => "rlm:query:end",
            RlmEvent::BatchStart { .. } => "rlm:batch:start",
            RlmEvent::BatchEnd { .. } => "rlm:batch:end",
            RlmEvent::Search { .. } => "rlm:search",
            RlmEvent::Ingest { .. } => "rlm:ingest",
            RlmEvent::Toggle { .. } => "rlm:toggle",
            RlmEvent::Initialized { .. } => "rlm:initialized",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            RlmEvent::Externalize { object_ids, count, tokens_saved } => json!({
                "objectIds": object_ids,
                "count": count,
                "tokensSaved": tokens_saved,
            }),
            RlmEvent::QueryStart { operation_id, targets } => json!({
                "operationId": operation_id,
                "targets": targets,
            }),
            RlmEvent::QueryEnd { operation_id, status } => json!({
                "operationId": operation_id,
                "status": status,
            }),
            RlmEvent::BatchStart { operation_id, targets } => json!({
                "operationId": operation_id,
                "targets": targets,
            }),
            RlmEvent::BatchEnd { operation_id, completed } => json!({
                "operationId": operation_id,
                "completed": completed,
            }),
            RlmEvent::Search { pattern, matches } => json!({
                "pattern": pattern,
                "matches": matches,
            }),
            RlmEvent::Ingest { files, bytes } => json!({
                "files": files,
                "bytes": bytes,
            }),
            RlmEvent::Toggle { enabled } => json!({ "enabled": enabled }),
            RlmEvent::Initialized { session_id, objects } => json!({
                "sessionId": session_id,
                "objects": objects,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_namespaced() {
        let event = RlmEvent::Toggle { enabled: false };
        assert_eq!(event.name(), "rlm:toggle");
        assert_eq!(event.payload()["enabled"], false);
    }

    #[test]
    fn externalize_payload_uses_camel_case() {
        let event = RlmEvent::Externalize {
            object_ids: vec!["rlm-obj-1".into()],
            count: 1,
            tokens_saved: 420,
        };
        let payload = event.payload();
        assert_eq!(payload["objectIds"][0], "rlm-obj-1");
        assert_eq!(payload["tokensSaved"], 420);
    }
}
