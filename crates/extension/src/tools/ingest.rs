//! `rlm_ingest`: read files from disk into the external store.
//!
//! Paths and globs resolve relative to the host cwd. Dependency and VCS
//! directories are excluded, binaries are detected by a NUL probe over
//! the first 512 bytes, and both a file-count and a byte budget cap one
//! invocation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use rlm_domain::events::RlmEvent;
use rlm_domain::record::{ContentKind, NewRecord, RecordSource};
use rlm_domain::{Error, Result};

use crate::host::ToolOutput;
use crate::session::RlmSession;

const EXCLUDED_COMPONENTS: &[&str] = &["node_modules", ".git"];
const BINARY_PROBE_BYTES: usize = 512;
/// Above this many matches, an attached UI confirms before ingesting.
const CONFIRM_THRESHOLD: usize = 10;

#[derive(Deserialize)]
struct IngestParams {
    paths: Vec<String>,
}

pub(crate) async fn execute(
    session: &RlmSession,
    params: serde_json::Value,
) -> Result<ToolOutput> {
    let params: IngestParams = serde_json::from_value(params)
        .map_err(|e| Error::Parse(format!("invalid rlm_ingest parameters: {e}")))?;
    if params.paths.is_empty() {
        return Err(Error::Parse("rlm_ingest needs at least one path".into()));
    }
    let _phase = session.enter_phase("ingest");

    let cfg = session.config().read().clone();
    let cwd = session.host().cwd();
    let mut notes = Vec::new();

    // Resolve paths and globs into a stable, deduplicated file list.
    let mut files: BTreeSet<PathBuf> = BTreeSet::new();
    for raw in &params.paths {
        if raw.contains(['*', '?', '[']) {
            let pattern = cwd.join(raw);
            match glob::glob(&pattern.to_string_lossy()) {
                Ok(entries) => {
                    for path in entries.flatten() {
                        if path.is_file() && !is_excluded(&path) {
                            files.insert(path);
                        }
                    }
                }
                Err(e) => notes.push(format!("invalid glob '{raw}': {e}")),
            }
        } else {
            let path = if Path::new(raw).is_absolute() {
                PathBuf::from(raw)
            } else {
                cwd.join(raw)
            };
            if !path.is_file() {
                notes.push(format!("'{raw}' is not a readable file"));
            } else if !is_excluded(&path) {
                files.insert(path);
            }
        }
    }

    if files.len() > cfg.max_ingest_files {
        return Err(Error::Budget(format!(
            "{} files matched; the ingest limit is {}",
            files.len(),
            cfg.max_ingest_files
        )));
    }
    if files.len() > CONFIRM_THRESHOLD && session.host().has_ui() {
        let message = format!("Ingest {} files into the RLM store?", files.len());
        if !session.host().confirm(&message).await {
            return Ok(ToolOutput::ok("Ingestion cancelled."));
        }
    }

    let mut ingested: Vec<(String, PathBuf)> = Vec::new();
    let mut skipped = 0usize;
    let mut total_bytes = 0u64;
    for path in files {
        if session.store().find_by_ingest_path(&path).is_some() {
            skipped += 1;
            continue;
        }
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                notes.push(format!("could not read {}: {e}", path.display()));
                skipped += 1;
                continue;
            }
        };
        if bytes
            .iter()
            .take(BINARY_PROBE_BYTES)
            .any(|&b| b == 0)
        {
            notes.push(format!("skipping binary file {}", path.display()));
            skipped += 1;
            continue;
        }
        if total_bytes + bytes.len() as u64 > cfg.max_ingest_bytes {
            notes.push(format!(
                "byte budget of {} reached; remaining files skipped",
                cfg.max_ingest_bytes
            ));
            break;
        }
        total_bytes += bytes.len() as u64;

        let content = String::from_utf8_lossy(&bytes).into_owned();
        let description = path
            .strip_prefix(&cwd)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        let token_estimate = (content.chars().count() as u64).div_ceil(4);
        let record = session.store().add(NewRecord {
            kind: ContentKind::File,
            description,
            token_estimate,
            source: RecordSource::Ingested { path: path.clone() },
            content,
        });
        ingested.push((record.id, path));
    }

    session.emit(RlmEvent::Ingest {
        files: ingested.len(),
        bytes: total_bytes,
    });

    let mut text = format!(
        "Ingested {} file(s) ({} bytes); {} skipped.\n",
        ingested.len(),
        total_bytes,
        skipped
    );
    for (id, path) in &ingested {
        text.push_str(&format!("- {id}: {}\n", path.display()));
    }
    for note in &notes {
        text.push_str(&format!("note: {note}\n"));
    }
    Ok(ToolOutput::ok(text))
}

fn is_excluded(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| EXCLUDED_COMPONENTS.contains(&s))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_and_vcs_paths_are_excluded() {
        assert!(is_excluded(Path::new("/repo/node_modules/pkg/index.js")));
        assert!(is_excluded(Path::new("/repo/.git/HEAD")));
        assert!(!is_excluded(Path::new("/repo/src/main.rs")));
    }
}
