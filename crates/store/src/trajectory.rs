//! Append-only operational log (`trajectory.jsonl`).
//!
//! One JSON line per externalization pass and per child call, appended
//! through the session's write queue so it never races the store files.

use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::queue::WriteQueue;

pub const TRAJECTORY_FILE: &str = "trajectory.jsonl";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrajectoryRecord {
    Externalize {
        turn: u64,
        object_ids: Vec<String>,
        tokens_saved: u64,
        forced: bool,
    },
    ChildCall {
        operation_id: String,
        call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_call_id: Option<String>,
        depth: u32,
        model: String,
        status: String,
        input_tokens: u64,
        output_tokens: u64,
        duration_ms: u64,
    },
}

#[derive(Serialize)]
struct TrajectoryLine<'a> {
    ts: String,
    #[serde(flatten)]
    record: &'a TrajectoryRecord,
}

/// Writes trajectory lines for one session directory.
pub struct TrajectoryWriter {
    path: PathBuf,
}

impl TrajectoryWriter {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: session_dir.into().join(TRAJECTORY_FILE),
        }
    }

    /// Enqueue one record append. Failures are logged by the queue and
    /// never affect the caller.
    pub fn append(&self, queue: &WriteQueue, record: TrajectoryRecord) {
        let line = match serde_json::to_string(&TrajectoryLine {
            ts: Utc::now().to_rfc3339(),
            record: &record,
        }) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize trajectory record");
                return;
            }
        };
        let path = self.path.clone();
        queue.enqueue(
            "trajectory",
            Box::pin(async move {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
                file.flush().await?;
                Ok(())
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn appends_one_line_per_record() {
        let tmp = TempDir::new().unwrap();
        let queue = WriteQueue::new();
        let writer = TrajectoryWriter::new(tmp.path());

        writer.append(
            &queue,
            TrajectoryRecord::Externalize {
                turn: 1,
                object_ids: vec!["rlm-obj-1".into()],
                tokens_saved: 300,
                forced: false,
            },
        );
        writer.append(
            &queue,
            TrajectoryRecord::ChildCall {
                operation_id: "op-1".into(),
                call_id: "call-1".into(),
                parent_call_id: None,
                depth: 1,
                model: "test-model".into(),
                status: "success".into(),
                input_tokens: 10,
                output_tokens: 5,
                duration_ms: 42,
            },
        );
        queue.flush().await.unwrap();

        let raw = std::fs::read_to_string(tmp.path().join(TRAJECTORY_FILE)).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "externalize");
        assert_eq!(first["tokens_saved"], 300);
        assert!(first["ts"].is_string());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "child_call");
        assert_eq!(second["status"], "success");
    }
}
