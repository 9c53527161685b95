//! Tool registry: definitions exposed to the host and the handlers
//! behind them. Dispatch lives on [`crate::session::RlmSession`].

pub mod ingest;
pub mod peek;
pub mod query;
pub mod search;
pub mod stats;

use rlm_domain::message::ToolDefinition;

/// Build the set of tool definitions this extension registers.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "rlm_peek".into(),
            description: "View a window of an externalized object's content.".into(),
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
            description: "Search externalized objects for a substring or /regex/ pattern.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Substring, or /body/flags regex" },
                    "scope": {
                        "description": "\"all\" (default) or a list of object ids",
                        "oneOf": [
                            { "type": "string" },
                            { "type": "array", "items": { "type": "string" } }
                        ]
                    }
                },
                "required": ["pattern"]
            }),
        },
        ToolDefinition {
            name: "rlm_query".into(),
            description: "Ask a focused sub-agent a question about one or more stored objects.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "instructions": { "type": "string", "description": "What the sub-agent should determine" },
                    "target": {
                        "description": "Object id or list of ids to analyze together",
                        "oneOf": [
                            { "type": "string" },
                            { "type": "array", "items": { "type": "string" } }
                        ]
                    },
                    "model": { "type": "string", "description": "Optional model override" }
                },
                "required": ["instructions", "target"]
            }),
        },
        ToolDefinition {
            name: "rlm_batch".into(),
            description: "Run the same question against several stored objects in parallel, one sub-agent each.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "instructions": { "type": "string", "description": "What each sub-agent should determine" },
                    "targets": { "type": "array", "items": { "type": "string" }, "description": "Object ids, one sub-agent per id" },
                    "model": { "type": "string", "description": "Optional model override" }
                },
                "required": ["instructions", "targets"]
            }),
        },
        ToolDefinition {
            name: "rlm_ingest".into(),
            description: "Read files (paths or globs, relative to the cwd) into the external store.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "paths": { "type": "array", "items": { "type": "string" }, "description": "File paths or glob patterns" }
                },
                "required": ["paths"]
            }),
        },
        ToolDefinition {
            name: "rlm_stats".into(),
            description: "Summarize the external store, context usage, and active child calls.".into(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_six_tools_are_registered() {
        let defs = definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["rlm_peek", "rlm_search", "rlm_query", "rlm_batch", "rlm_ingest", "rlm_stats"]
        );
        for def in &defs {
            assert_eq!(def.parameters["type"], "object");
        }
    }
}
