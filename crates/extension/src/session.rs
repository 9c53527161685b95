//! Session wiring and lifecycle.
//!
//! One [`RlmSession`] owns the store, warm tracker, token oracle, call
//! tree, recursive engine, and externalizer for a host session, and
//! implements the host's lifecycle events: store initialization (with
//! retention purge, prior-session merge, and the first-run marker),
//! per-turn context processing, the compaction gate, and shutdown flush.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use rlm_domain::config::RlmConfig;
use rlm_domain::events::RlmEvent;
use rlm_domain::message::Message;
use rlm_engine::adapter::{ModelAdapter, ModelRegistry};
use rlm_engine::{CallTree, RecursiveEngine};
use rlm_store::trajectory::{TrajectoryRecord, TrajectoryWriter};
use rlm_store::{ExternalStore, TokenOracle, WarmTracker};

use crate::commands;
use crate::externalizer::Externalizer;
use crate::host::{CompactDecision, HostContext, ToolOutput};
use crate::tools;

/// Session state directory relative to the host cwd.
const STATE_SUBDIR: &str = ".pi/rlm";
/// First-run marker under the user's home directory.
const INSTALL_MARKER: &str = ".pi/rlm/.installed";

pub struct RlmSession {
    host: Arc<dyn HostContext>,
    config: Arc<RwLock<RlmConfig>>,
    store: Arc<ExternalStore>,
    warm: Arc<WarmTracker>,
    oracle: Arc<Mutex<TokenOracle>>,
    tree: Arc<CallTree>,
    engine: Arc<RecursiveEngine>,
    externalizer: Externalizer,
    trajectory: TrajectoryWriter,
    enabled: AtomicBool,
    active_phases: Mutex<Vec<&'static str>>,
}

impl RlmSession {
    /// Build and initialize a session: open (or recover) the store, purge
    /// expired session directories, merge the most recent prior session in
    /// this cwd, and surface the first-run notice.
    pub async fn initialize(
        host: Arc<dyn HostContext>,
        adapter: Arc<dyn ModelAdapter>,
        config: RlmConfig,
    ) -> Arc<Self> {
        let session_id = host.session_id();
        let base = host.cwd().join(STATE_SUBDIR);
        let dir = base.join(&session_id);

        let store = Arc::new(ExternalStore::new(&dir, &session_id));
        let store_ok = store.initialize().await.is_ok();

        let enabled = config.enabled;
        let config = Arc::new(RwLock::new(config));
        let warm = Arc::new(WarmTracker::new());
        let oracle = Arc::new(Mutex::new(TokenOracle::new()));
        let tree = Arc::new(CallTree::new(config.read().max_child_calls));
        let models = Arc::new(ModelRegistry::new(host.known_models()));
        let engine = Arc::new(RecursiveEngine::new(
            store.clone(),
            warm.clone(),
            tree.clone(),
            adapter,
            models,
            config.clone(),
        ));
        let externalizer = Externalizer::new(store.clone(), warm.clone(), oracle.clone());
        let trajectory = TrajectoryWriter::new(&dir);

        let session = Arc::new(Self {
            host,
            config,
            store,
            warm,
            oracle,
            tree,
            engine,
            externalizer,
            trajectory,
            enabled: AtomicBool::new(enabled),
            active_phases: Mutex::new(Vec::new()),
        });

        if store_ok {
            session.purge_expired_sessions(&base).await;
            session.merge_latest_prior_session(&base, &dir).await;
            session.store.rebuild_externalized_map();
            session.first_run_notice().await;
            session.emit(RlmEvent::Initialized {
                session_id,
                objects: session.store.object_count(),
            });
        } else {
            session.host.notify(
                "RLM store failed to initialize; externalization is disabled for this session.",
            );
        }
        session
    }

    // ── Accessors for tools and commands ──────────────────────────

    pub fn host(&self) -> &Arc<dyn HostContext> {
        &self.host
    }

    pub fn config(&self) -> &Arc<RwLock<RlmConfig>> {
        &self.config
    }

    pub fn store(&self) -> &Arc<ExternalStore> {
        &self.store
    }

    pub fn warm(&self) -> &Arc<WarmTracker> {
        &self.warm
    }

    pub fn tree(&self) -> &Arc<CallTree> {
        &self.tree
    }

    pub fn engine(&self) -> &Arc<RecursiveEngine> {
        &self.engine
    }

    pub fn externalizer(&self) -> &Externalizer {
        &self.externalizer
    }

    pub fn oracle(&self) -> &Arc<Mutex<TokenOracle>> {
        &self.oracle
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enabled and backed by a healthy store.
    pub fn is_active(&self) -> bool {
        self.is_enabled() && self.store.is_healthy()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.tree.abort_all();
            self.externalizer.reset_latch();
        }
        self.emit(RlmEvent::Toggle { enabled });
    }

    pub fn active_phases(&self) -> Vec<String> {
        self.active_phases
            .lock()
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    pub(crate) fn enter_phase(&self, name: &'static str) -> PhaseGuard<'_> {
        self.active_phases.lock().push(name);
        PhaseGuard { session: self, name }
    }

    /// Publish an event on the host bus; failures are logged, never fatal.
    pub fn emit(&self, event: RlmEvent) {
        if let Err(e) = self.host.emit_event(event.name(), event.payload()) {
            tracing::warn!(event = event.name(), error = %e, "event emission failed");
        }
    }

    // ── Lifecycle handlers ────────────────────────────────────────

    /// `context` event: run the externalizer over the live message list.
    pub fn on_context(&self, messages: &mut Vec<Message>) {
        if !self.is_active() {
            return;
        }
        let _phase = self.enter_phase("externalize");
        let usage = self.host.context_usage();
        let cfg = self.config.read().clone();
        let outcome = self.externalizer.process(messages, &usage, &cfg);
        if !outcome.externalized_ids.is_empty() {
            self.trajectory.append(
                self.store.queue(),
                TrajectoryRecord::Externalize {
                    turn: outcome.turn,
                    object_ids: outcome.externalized_ids.clone(),
                    tokens_saved: outcome.tokens_saved,
                    forced: outcome.forced,
                },
            );
            self.emit(RlmEvent::Externalize {
                count: outcome.externalized_ids.len(),
                object_ids: outcome.externalized_ids,
                tokens_saved: outcome.tokens_saved,
            });
        }
    }

    /// `session_before_compact`: cancel host compaction unless the safety
    /// valve latched permission; the latch is consumed either way.
    pub fn on_before_compact(&self) -> Option<CompactDecision> {
        if !self.is_active() {
            return None;
        }
        if self.externalizer.take_allow_compaction() {
            None
        } else {
            Some(CompactDecision { cancel: true })
        }
    }

    /// `session_shutdown`: drain pending writes.
    pub async fn on_shutdown(&self) {
        if let Err(e) = self.store.flush().await {
            tracing::warn!(error = %e, "flush on shutdown failed");
        }
    }

    /// `session_before_switch`: same flush discipline as shutdown; the
    /// store directory stays behind for the next session to merge.
    pub async fn on_before_switch(&self) {
        self.on_shutdown().await;
    }

    // ── Tool dispatch ─────────────────────────────────────────────

    /// Execute one registered tool. Never panics or throws: disabled state
    /// and internal failures come back as error results.
    pub async fn execute_tool(
        &self,
        name: &str,
        params: serde_json::Value,
        tool_call_id: &str,
    ) -> ToolOutput {
        if !self.is_enabled() {
            return ToolOutput::error("RLM is disabled. Enable it with /rlm on.");
        }
        if !self.store.is_healthy() {
            return ToolOutput::error("RLM store is unavailable for this session.");
        }
        let result = match name {
            "rlm_peek" => tools::peek::execute(self, params, tool_call_id).await,
            "rlm_search" => tools::search::execute(self, params, tool_call_id).await,
            "rlm_query" => tools::query::execute_query(self, params).await,
            "rlm_batch" => tools::query::execute_batch(self, params).await,
            "rlm_ingest" => tools::ingest::execute(self, params).await,
            "rlm_stats" => tools::stats::execute(self).await,
            other => return ToolOutput::error(format!("RLM error in {other}: unknown tool")),
        };
        result.unwrap_or_else(|e| ToolOutput::error(format!("RLM error in {name}: {e}")))
    }

    /// `/rlm` slash command entry point.
    pub async fn handle_command(&self, raw: &str) -> String {
        commands::handle(self, raw).await
    }

    // ── Startup chores ────────────────────────────────────────────

    /// Delete session directories whose last modification is older than
    /// the retention window.
    async fn purge_expired_sessions(&self, base: &Path) {
        let retention_days = self.config.read().retention_days;
        if retention_days == 0 {
            return;
        }
        let cutoff = Duration::from_secs(retention_days as u64 * 86_400);
        let mut entries = match tokio::fs::read_dir(base).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() || path == self.store.dir() {
                continue;
            }
            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            let expired = SystemTime::now()
                .duration_since(modified)
                .is_ok_and(|age| age > cutoff);
            if expired {
                match tokio::fs::remove_dir_all(&path).await {
                    Ok(()) => tracing::info!(dir = %path.display(), "purged expired session"),
                    Err(e) => tracing::warn!(dir = %path.display(), error = %e, "purge failed"),
                }
            }
        }
    }

    /// Import the most recently modified prior session store in this cwd
    /// so retrieval works across session restarts.
    async fn merge_latest_prior_session(&self, base: &Path, current: &Path) {
        let mut latest: Option<(SystemTime, PathBuf)> = None;
        let mut entries = match tokio::fs::read_dir(base).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() || path == current {
                continue;
            }
            if !path.join("store.jsonl").exists() {
                continue;
            }
            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            if latest.as_ref().is_none_or(|(t, _)| modified > *t) {
                latest = Some((modified, path));
            }
        }
        if let Some((_, dir)) = latest {
            match self.store.merge_from(&dir).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(from = %dir.display(), imported = n, "resumed prior session store"),
                Err(e) => tracing::warn!(from = %dir.display(), error = %e, "prior session merge failed"),
            }
        }
    }

    /// One-time notice gated by the home-directory marker file.
    async fn first_run_notice(&self) {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let marker = home.join(INSTALL_MARKER);
        if marker.exists() {
            return;
        }
        if let Some(parent) = marker.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(error = %e, "could not create first-run marker directory");
                return;
            }
        }
        if let Err(e) = tokio::fs::write(&marker, Utc::now().to_rfc3339()).await {
            tracing::warn!(error = %e, "could not write first-run marker");
            return;
        }
        self.host.notify(
            "RLM is active: long histories are externalized to .pi/rlm and retrievable \
             with rlm_peek / rlm_search / rlm_query. Use /rlm for status.",
        );
    }
}

pub(crate) struct PhaseGuard<'a> {
    session: &'a RlmSession,
    name: &'static str,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        let mut phases = self.session.active_phases.lock();
        if let Some(pos) = phases.iter().rposition(|&p| p == self.name) {
            phases.remove(pos);
        }
    }
}
