//! Store record and index shapes.
//!
//! A record is created once (on externalization, ingestion, or child-result
//! capture) and never mutated. The index mirrors the append-only log and
//! tracks each record's byte position in it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current on-disk schema version of `index.json`.
pub const INDEX_VERSION: u32 = 1;

/// Sentinel offset/length for an index entry whose write has not landed yet.
pub const PENDING_OFFSET: i64 = -1;

/// What kind of content a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Conversation,
    ToolOutput,
    File,
    Artifact,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Conversation => "conversation",
            ContentKind::ToolOutput => "tool_output",
            ContentKind::File => "file",
            ContentKind::Artifact => "artifact",
        }
    }
}

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordSource {
    /// Replaced a host message; carries that message's fingerprint.
    Externalized { fingerprint: String },
    /// Read from disk by `rlm_ingest`; carries the absolute path.
    Ingested { path: PathBuf },
    /// Captured output of a recursive child call.
    ChildResult { call_id: String },
}

/// One immutable record in the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub description: String,
    pub token_estimate: u64,
    pub source: RecordSource,
    pub content: String,
}

/// A record as handed to `add`; the store mints id and timestamp.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub kind: ContentKind,
    pub description: String,
    pub token_estimate: u64,
    pub source: RecordSource,
    pub content: String,
}

/// Index entry mirroring one record's position in `store.jsonl`.
///
/// `offset`/`length` are [`PENDING_OFFSET`] until the queued append
/// completes, then cover the record's full line including its newline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub description: String,
    pub token_estimate: u64,
    pub created_at: DateTime<Utc>,
    pub offset: i64,
    pub length: i64,
}

impl IndexEntry {
    pub fn pending(record: &ObjectRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind,
            description: record.description.clone(),
            token_estimate: record.token_estimate,
            created_at: record.created_at,
            offset: PENDING_OFFSET,
            length: PENDING_OFFSET,
        }
    }
}

/// The full persistent index, rewritten in whole after each change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreIndex {
    pub version: u32,
    pub session_id: String,
    pub entries: Vec<IndexEntry>,
    pub total_tokens: u64,
}

impl StoreIndex {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            version: INDEX_VERSION,
            session_id: session_id.into(),
            entries: Vec::new(),
            total_tokens: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ObjectRecord {
        ObjectRecord {
            id: "rlm-obj-0a1b2c3d".into(),
            created_at: Utc::now(),
            kind: ContentKind::ToolOutput,
            description: "tool output: ls -la".into(),
            token_estimate: 120,
            source: RecordSource::Externalized {
                fingerprint: "toolResult:call-1".into(),
            },
            content: "total 48\ndrwxr-xr-x ...".into(),
        }
    }

    #[test]
    fn record_source_tagged_encoding() {
        let json = serde_json::to_value(RecordSource::Ingested {
            path: PathBuf::from("/etc/hosts"),
        })
        .unwrap();
        assert_eq!(json["kind"], "ingested");
        assert_eq!(json["path"], "/etc/hosts");
    }

    #[test]
    fn record_round_trips_as_one_json_line() {
        let record = sample_record();
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        let back: ObjectRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, record.id);
        assert_eq!(back.kind, ContentKind::ToolOutput);
        assert_eq!(back.source, record.source);
    }

    #[test]
    fn pending_entry_carries_sentinels() {
        let entry = IndexEntry::pending(&sample_record());
        assert_eq!(entry.offset, PENDING_OFFSET);
        assert_eq!(entry.length, PENDING_OFFSET);
        assert_eq!(entry.token_estimate, 120);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_value(ContentKind::ToolOutput).unwrap();
        assert_eq!(json, "tool_output");
    }
}
