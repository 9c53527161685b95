//! The on-disk external store.
//!
//! Layout under `<cwd>/.pi/rlm/<session-id>/`:
//! - `store.jsonl`: append-only, one record per line
//! - `index.json`: full index, rewritten after each change
//!
//! All reads are synchronous against in-memory state; all disk writes go
//! through the single-writer [`WriteQueue`]. The log is replayable: a
//! fresh initialize over the same directory reconstructs an isomorphic
//! in-memory state, skipping malformed lines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;

use rlm_domain::record::{
    IndexEntry, NewRecord, ObjectRecord, RecordSource, StoreIndex, INDEX_VERSION,
};
use rlm_domain::{Error, Result};

use crate::queue::{WriteHandle, WriteQueue};

pub const STORE_FILE: &str = "store.jsonl";
pub const INDEX_FILE: &str = "index.json";

struct StoreInner {
    records: HashMap<String, ObjectRecord>,
    index: StoreIndex,
    /// id -> position in `index.entries`.
    positions: HashMap<String, usize>,
    /// fingerprint -> id, for externalization dedup.
    externalized: HashMap<String, String>,
    /// Next byte offset in `store.jsonl`.
    cursor: u64,
}

/// Content-addressable, append-only record store for one session.
pub struct ExternalStore {
    dir: PathBuf,
    session_id: String,
    queue: WriteQueue,
    inner: Arc<RwLock<StoreInner>>,
    healthy: AtomicBool,
}

impl ExternalStore {
    /// Create an unopened store rooted at `dir`. Call
    /// [`initialize`](Self::initialize) before use.
    pub fn new(dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        Self {
            dir: dir.into(),
            session_id: session_id.clone(),
            queue: WriteQueue::new(),
            inner: Arc::new(RwLock::new(StoreInner {
                records: HashMap::new(),
                index: StoreIndex::new(session_id),
                positions: HashMap::new(),
                externalized: HashMap::new(),
                cursor: 0,
            })),
            healthy: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The shared single-writer queue for this session's directory.
    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }

    /// False after a failed initialize; the externalizer checks this and
    /// stands down for the session.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Create the directory, load a version-compatible `index.json`,
    /// replay `store.jsonl`, and position the write cursor at the end of
    /// the log. Malformed log lines are skipped with a warning.
    pub async fn initialize(&self) -> Result<()> {
        match self.initialize_inner().await {
            Ok(()) => {
                self.healthy.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                tracing::warn!(
                    dir = %self.dir.display(),
                    error = %e,
                    "store initialization failed; store is degraded"
                );
                Err(e)
            }
        }
    }

    async fn initialize_inner(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        // Load index.json when present and version-compatible.
        let index_path = self.dir.join(INDEX_FILE);
        let loaded_index: Option<StoreIndex> = match tokio::fs::read(&index_path).await {
            Ok(bytes) => match serde_json::from_slice::<StoreIndex>(&bytes) {
                Ok(idx) if idx.version == INDEX_VERSION => Some(idx),
                Ok(idx) => {
                    tracing::warn!(
                        found = idx.version,
                        expected = INDEX_VERSION,
                        "index.json version mismatch; rebuilding from log"
                    );
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "index.json is malformed; rebuilding from log");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        // Replay the log line by line, tracking each line's byte span.
        let log_path = self.dir.join(STORE_FILE);
        let mut records: HashMap<String, ObjectRecord> = HashMap::new();
        let mut scan_order: Vec<String> = Vec::new();
        let mut spans: HashMap<String, (u64, u64)> = HashMap::new();
        let mut cursor = 0u64;

        match tokio::fs::read(&log_path).await {
            Ok(bytes) => {
                let mut at = 0usize;
                while at < bytes.len() {
                    let end = bytes[at..]
                        .iter()
                        .position(|&b| b == b'\n')
                        .map(|p| at + p + 1)
                        .unwrap_or(bytes.len());
                    let line = &bytes[at..end];
                    let body = match line.last() {
                        Some(b'\n') => &line[..line.len() - 1],
                        _ => line,
                    };
                    if !body.iter().all(|b| b.is_ascii_whitespace()) {
                        match serde_json::from_slice::<ObjectRecord>(body) {
                            Ok(rec) => {
                                spans.insert(rec.id.clone(), (at as u64, (end - at) as u64));
                                if records.insert(rec.id.clone(), rec.clone()).is_none() {
                                    scan_order.push(rec.id);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    offset = at,
                                    error = %e,
                                    "skipping malformed store.jsonl line"
                                );
                            }
                        }
                    }
                    at = end;
                }
                cursor = bytes.len() as u64;

                // Repair a log that was cut mid-line so the next append
                // starts on a fresh line.
                if bytes.last().is_some_and(|&b| b != b'\n') {
                    let mut file = tokio::fs::OpenOptions::new()
                        .append(true)
                        .open(&log_path)
                        .await?;
                    file.write_all(b"\n").await?;
                    file.flush().await?;
                    cursor += 1;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Rebuild the index: keep loaded entries whose records survived the
        // replay, then append entries for records the index never saw.
        let mut index = StoreIndex::new(&self.session_id);
        if let Some(loaded) = loaded_index {
            for entry in loaded.entries {
                if records.contains_key(&entry.id) {
                    index.entries.push(entry);
                } else {
                    tracing::warn!(id = %entry.id, "dropping index entry with no log record");
                }
            }
        }
        {
            let known: std::collections::HashSet<&str> =
                index.entries.iter().map(|e| e.id.as_str()).collect();
            let missing: Vec<&String> =
                scan_order.iter().filter(|id| !known.contains(id.as_str())).collect();
            for id in missing {
                index.entries.push(IndexEntry::pending(&records[id]));
            }
        }
        for entry in &mut index.entries {
            if let Some(&(offset, length)) = spans.get(&entry.id) {
                entry.offset = offset as i64;
                entry.length = length as i64;
            }
            index.total_tokens += entry.token_estimate;
        }

        let mut inner = self.inner.write();
        inner.positions = index
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
        inner.externalized = records
            .values()
            .filter_map(|r| match &r.source {
                RecordSource::Externalized { fingerprint } => {
                    Some((fingerprint.clone(), r.id.clone()))
                }
                _ => None,
            })
            .collect();
        inner.records = records;
        inner.index = index;
        inner.cursor = cursor;

        tracing::info!(
            dir = %self.dir.display(),
            records = inner.records.len(),
            tokens = inner.index.total_tokens,
            "external store loaded"
        );
        Ok(())
    }

    // ── Writes ────────────────────────────────────────────────────

    /// Mint an id and timestamp, insert in memory, and enqueue the disk
    /// append. Returns the completed record immediately.
    pub fn add(&self, new: NewRecord) -> ObjectRecord {
        let record = {
            let mut inner = self.inner.write();
            let id = mint_id(&inner.records);
            let record = ObjectRecord {
                id: id.clone(),
                created_at: Utc::now(),
                kind: new.kind,
                description: new.description,
                token_estimate: new.token_estimate,
                source: new.source,
                content: new.content,
            };
            let pos = inner.index.entries.len();
            inner.index.entries.push(IndexEntry::pending(&record));
            inner.index.total_tokens += record.token_estimate;
            inner.positions.insert(id.clone(), pos);
            if let RecordSource::Externalized { fingerprint } = &record.source {
                inner.externalized.insert(fingerprint.clone(), id.clone());
            }
            inner.records.insert(id, record.clone());
            record
        };
        self.schedule_append(record.clone());
        record
    }

    /// Append one record line, patch its index entry with the observed
    /// byte span, and rewrite `index.json`.
    fn schedule_append(&self, record: ObjectRecord) -> WriteHandle {
        let inner = self.inner.clone();
        let dir = self.dir.clone();
        let id = record.id.clone();
        self.queue.enqueue(
            format!("append {id}"),
            Box::pin(async move {
                let mut line = serde_json::to_string(&record)?;
                line.push('\n');
                let bytes = line.into_bytes();

                let offset = inner.read().cursor;
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(STORE_FILE))
                    .await?;
                file.write_all(&bytes).await?;
                file.flush().await?;

                let snapshot = {
                    let mut g = inner.write();
                    g.cursor = offset + bytes.len() as u64;
                    if let Some(&pos) = g.positions.get(&id) {
                        let entry = &mut g.index.entries[pos];
                        entry.offset = offset as i64;
                        entry.length = bytes.len() as i64;
                    }
                    g.index.clone()
                };
                let json = serde_json::to_vec_pretty(&snapshot)?;
                tokio::fs::write(dir.join(INDEX_FILE), json).await?;
                Ok(())
            }),
        )
    }

    /// Await the write queue drain.
    pub async fn flush(&self) -> Result<()> {
        self.queue.flush().await
    }

    /// Drop all in-memory state and delete both files.
    pub async fn clear(&self) -> Result<()> {
        {
            let mut inner = self.inner.write();
            inner.records.clear();
            inner.positions.clear();
            inner.externalized.clear();
            inner.index.entries.clear();
            inner.index.total_tokens = 0;
            inner.cursor = 0;
        }
        let dir = self.dir.clone();
        self.queue
            .enqueue(
                "clear",
                Box::pin(async move {
                    for name in [STORE_FILE, INDEX_FILE] {
                        match tokio::fs::remove_file(dir.join(name)).await {
                            Ok(()) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => return Err(Error::Io(e)),
                        }
                    }
                    Ok(())
                }),
            )
            .wait()
            .await
    }

    /// Import every record from another session directory whose id is not
    /// already present. Returns the number of imported records.
    pub async fn merge_from(&self, other_dir: &Path) -> Result<usize> {
        let raw = match tokio::fs::read_to_string(other_dir.join(STORE_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut imported = 0usize;
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record = match serde_json::from_str::<ObjectRecord>(line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed line during merge");
                    continue;
                }
            };
            {
                let mut inner = self.inner.write();
                if inner.records.contains_key(&record.id) {
                    continue;
                }
                let pos = inner.index.entries.len();
                inner.index.entries.push(IndexEntry::pending(&record));
                inner.index.total_tokens += record.token_estimate;
                inner.positions.insert(record.id.clone(), pos);
                if let RecordSource::Externalized { fingerprint } = &record.source {
                    inner
                        .externalized
                        .insert(fingerprint.clone(), record.id.clone());
                }
                inner.records.insert(record.id.clone(), record.clone());
            }
            self.schedule_append(record);
            imported += 1;
        }

        if imported > 0 {
            tracing::info!(
                from = %other_dir.display(),
                imported,
                "merged records from prior session"
            );
        }
        Ok(imported)
    }

    // ── Reads ─────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<ObjectRecord> {
        self.inner.read().records.get(id).cloned()
    }

    pub fn get_index_entry(&self, id: &str) -> Option<IndexEntry> {
        let inner = self.inner.read();
        let &pos = inner.positions.get(id)?;
        inner.index.entries.get(pos).cloned()
    }

    /// All ids in insertion order.
    pub fn all_ids(&self) -> Vec<String> {
        self.inner
            .read()
            .index
            .entries
            .iter()
            .map(|e| e.id.clone())
            .collect()
    }

    /// An independent copy of the full index.
    pub fn full_index(&self) -> StoreIndex {
        self.inner.read().index.clone()
    }

    /// Linear scan over ingested records for a matching source path.
    pub fn find_by_ingest_path(&self, path: &Path) -> Option<ObjectRecord> {
        self.inner
            .read()
            .records
            .values()
            .find(|r| matches!(&r.source, RecordSource::Ingested { path: p } if p == path))
            .cloned()
    }

    /// Look up the record that externalized a given fingerprint.
    pub fn externalized_id(&self, fingerprint: &str) -> Option<String> {
        self.inner.read().externalized.get(fingerprint).cloned()
    }

    /// Re-derive the fingerprint → id map from the record set. Run after
    /// initialize/merge so externalization stays monotonic across restarts.
    pub fn rebuild_externalized_map(&self) {
        let mut inner = self.inner.write();
        inner.externalized = inner
            .records
            .values()
            .filter_map(|r| match &r.source {
                RecordSource::Externalized { fingerprint } => {
                    Some((fingerprint.clone(), r.id.clone()))
                }
                _ => None,
            })
            .collect();
    }

    pub fn object_count(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn total_tokens(&self) -> u64 {
        self.inner.read().index.total_tokens
    }

    /// Combined on-disk size of the log and index, in bytes.
    pub fn disk_bytes(&self) -> u64 {
        [STORE_FILE, INDEX_FILE]
            .iter()
            .filter_map(|name| std::fs::metadata(self.dir.join(name)).ok())
            .map(|m| m.len())
            .sum()
    }
}

/// `rlm-obj-` + 4 random bytes as hex, re-rolled on collision.
fn mint_id(existing: &HashMap<String, ObjectRecord>) -> String {
    loop {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("rlm-obj-{}", &hex[..8]);
        if !existing.contains_key(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlm_domain::record::ContentKind;
    use tempfile::TempDir;

    fn new_record(description: &str, content: &str) -> NewRecord {
        NewRecord {
            kind: ContentKind::ToolOutput,
            description: description.into(),
            token_estimate: (content.chars().count() as u64).div_ceil(4),
            source: RecordSource::Externalized {
                fingerprint: format!("toolResult:{description}"),
            },
            content: content.into(),
        }
    }

    async fn open_store(dir: &Path) -> ExternalStore {
        let store = ExternalStore::new(dir, "sess-test");
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn add_is_synchronous_and_visible_immediately() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path()).await;

        let record = store.add(new_record("r1", "hello world"));
        assert!(record.id.starts_with("rlm-obj-"));
        assert_eq!(store.get(&record.id).unwrap().content, "hello world");

        // Pending until the queued write lands.
        let entry = store.get_index_entry(&record.id).unwrap();
        assert!(entry.offset == -1 || entry.offset >= 0);
        store.flush().await.unwrap();
        let entry = store.get_index_entry(&record.id).unwrap();
        assert!(entry.offset >= 0 && entry.length > 0);
    }

    #[tokio::test]
    async fn offsets_are_contiguous_and_byte_exact() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path()).await;

        let a = store.add(new_record("a", "first record body"));
        let b = store.add(new_record("b", "second record body, a bit longer"));
        let c = store.add(new_record("c", "third"));
        store.flush().await.unwrap();

        let ea = store.get_index_entry(&a.id).unwrap();
        let eb = store.get_index_entry(&b.id).unwrap();
        let ec = store.get_index_entry(&c.id).unwrap();
        assert_eq!(ea.offset, 0);
        assert_eq!(eb.offset, ea.offset + ea.length);
        assert_eq!(ec.offset, eb.offset + eb.length);

        let bytes = std::fs::read(tmp.path().join(STORE_FILE)).unwrap();
        let span = &bytes[eb.offset as usize..(eb.offset + eb.length) as usize];
        let mut expected = serde_json::to_string(&b).unwrap();
        expected.push('\n');
        assert_eq!(span, expected.as_bytes());
    }

    #[tokio::test]
    async fn replay_reconstructs_state() {
        let tmp = TempDir::new().unwrap();
        let ids: Vec<String> = {
            let store = open_store(tmp.path()).await;
            let ids = (0..3)
                .map(|i| store.add(new_record(&format!("r{i}"), &format!("content {i}"))).id)
                .collect();
            store.flush().await.unwrap();
            ids
        };

        let reopened = open_store(tmp.path()).await;
        assert_eq!(reopened.object_count(), 3);
        assert_eq!(reopened.all_ids(), ids);
        for id in &ids {
            let entry = reopened.get_index_entry(id).unwrap();
            assert!(entry.offset >= 0);
        }
        // Fingerprint map survives restart.
        assert_eq!(
            reopened.externalized_id("toolResult:r1"),
            Some(ids[1].clone())
        );
    }

    #[tokio::test]
    async fn crash_recovery_skips_trailing_garbage() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open_store(tmp.path()).await;
            store.add(new_record("ok", "intact record"));
            store.flush().await.unwrap();
        }
        // Simulate a crash mid-append.
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(tmp.path().join(STORE_FILE))
                .unwrap();
            f.write_all(b"{\"id\":\"rlm-obj-trunc").unwrap();
        }

        let store = open_store(tmp.path()).await;
        assert_eq!(store.object_count(), 1);

        // New appends land on a fresh line and replay cleanly.
        store.add(new_record("post", "after the crash"));
        store.flush().await.unwrap();
        let again = open_store(tmp.path()).await;
        assert_eq!(again.object_count(), 2);
    }

    #[tokio::test]
    async fn clear_removes_files_and_state() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path()).await;
        store.add(new_record("r", "soon gone"));
        store.flush().await.unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.object_count(), 0);
        assert!(!tmp.path().join(STORE_FILE).exists());
        assert!(!tmp.path().join(INDEX_FILE).exists());
    }

    #[tokio::test]
    async fn merge_imports_only_new_ids() {
        let tmp_a = TempDir::new().unwrap();
        let tmp_b = TempDir::new().unwrap();

        let store_a = open_store(tmp_a.path()).await;
        store_a.add(new_record("a1", "from session A"));
        store_a.flush().await.unwrap();

        let store_b = open_store(tmp_b.path()).await;
        store_b.add(new_record("b1", "native to B"));
        let imported = store_b.merge_from(tmp_a.path()).await.unwrap();
        assert_eq!(imported, 1);
        assert_eq!(store_b.object_count(), 2);

        // A second merge is a no-op.
        let imported = store_b.merge_from(tmp_a.path()).await.unwrap();
        assert_eq!(imported, 0);
    }

    #[tokio::test]
    async fn find_by_ingest_path_scans_ingested_records() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path()).await;
        store.add(NewRecord {
            kind: ContentKind::File,
            description: "etc/hosts".into(),
            token_estimate: 10,
            source: RecordSource::Ingested { path: "/etc/hosts".into() },
            content: "127.0.0.1 localhost".into(),
        });

        assert!(store.find_by_ingest_path(Path::new("/etc/hosts")).is_some());
        assert!(store.find_by_ingest_path(Path::new("/etc/passwd")).is_none());
    }
}
