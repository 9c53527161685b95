//! The per-turn externalization state machine.
//!
//! On every `context` event: tick the warm tracker, re-apply stubs for
//! fingerprints the store already knows, and, when usage crosses the
//! budget threshold, move eligible atomic groups into the store, splice
//! stubs in their place, and inject the manifest. A safety valve with a
//! conservative counter force-externalizes above the higher threshold and,
//! failing that, latches permission for one host compaction.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use rlm_domain::config::RlmConfig;
use rlm_domain::message::{ContentPart, Message, MessageContent, Role};
use rlm_domain::record::{ContentKind, NewRecord, ObjectRecord, RecordSource};
use rlm_store::manifest::build_manifest;
use rlm_store::oracle::{self, TokenOracle, DEFAULT_COVERAGE};
use rlm_store::{ExternalStore, WarmTracker};

use crate::fingerprint::fingerprint;
use crate::host::ContextUsage;

const STUB_PREFIX: &str = "[RLM externalized:";
const MANIFEST_PREFIX: &str = "## External Store Manifest";
const DESCRIPTION_SNIPPET_CHARS: usize = 80;

/// What one `context` pass did, for event emission and the trajectory.
#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    pub turn: u64,
    pub externalized_ids: Vec<String>,
    pub tokens_saved: u64,
    pub forced: bool,
    pub latched_compaction: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassMode {
    /// Point counter, warmth respected.
    Normal,
    /// Safe counter, warmth ignored, system messages untouchable.
    Force,
}

struct ExtState {
    turn: u64,
    force_next: bool,
    allow_compaction: bool,
}

/// Session-owned externalizer state plus its collaborators.
pub struct Externalizer {
    store: Arc<ExternalStore>,
    warm: Arc<WarmTracker>,
    oracle: Arc<Mutex<TokenOracle>>,
    state: Mutex<ExtState>,
}

impl Externalizer {
    pub fn new(
        store: Arc<ExternalStore>,
        warm: Arc<WarmTracker>,
        oracle: Arc<Mutex<TokenOracle>>,
    ) -> Self {
        Self {
            store,
            warm,
            oracle,
            state: Mutex::new(ExtState {
                turn: 0,
                force_next: false,
                allow_compaction: false,
            }),
        }
    }

    pub fn turn(&self) -> u64 {
        self.state.lock().turn
    }

    /// Request an externalization pass on the next `context` event even if
    /// usage is under the threshold (`/rlm externalize`).
    pub fn set_force_next(&self) {
        self.state.lock().force_next = true;
    }

    /// Consume the one-shot allow-compaction latch.
    pub fn take_allow_compaction(&self) -> bool {
        std::mem::take(&mut self.state.lock().allow_compaction)
    }

    pub fn allow_compaction(&self) -> bool {
        self.state.lock().allow_compaction
    }

    pub fn reset_latch(&self) {
        self.state.lock().allow_compaction = false;
    }

    // ── The per-turn pass ─────────────────────────────────────────

    pub fn process(
        &self,
        messages: &mut Vec<Message>,
        usage: &ContextUsage,
        cfg: &RlmConfig,
    ) -> PassOutcome {
        let mut outcome = PassOutcome::default();

        self.warm.tick();
        let force = {
            let mut state = self.state.lock();
            state.turn += 1;
            outcome.turn = state.turn;
            state.force_next
        };

        // Calibrate the oracle against the host's reported usage.
        if let Some(tokens) = usage.tokens {
            self.oracle.lock().observe(oracle::total_chars(messages), tokens);
        }

        // Phase 0: re-apply stubs for fingerprints the store already holds.
        self.replace_known_stubs(messages);

        // Without a usage signal there is nothing to threshold against.
        if usage.tokens.is_none() {
            self.inject_manifest(messages, cfg);
            return outcome;
        }

        let theta = usage.context_window * cfg.token_budget_percent as u64 / 100;
        let sigma = usage.context_window * cfg.safety_valve_percent as u64 / 100;

        // Phase 1: normal externalization.
        let tokens = self.measured_tokens(messages, PassMode::Normal);
        if force || tokens > theta {
            let (ids, saved) = self.externalize_pass(messages, theta, PassMode::Normal);
            outcome.externalized_ids.extend(ids);
            outcome.tokens_saved += saved;
            outcome.forced = force;
            self.state.lock().force_next = false;
        }

        // Phase 2: manifest injection.
        self.inject_manifest(messages, cfg);

        // Phase 3: safety valve with the conservative counter.
        if self.measured_tokens(messages, PassMode::Force) > sigma {
            let (ids, saved) = self.externalize_pass(messages, sigma, PassMode::Force);
            outcome.externalized_ids.extend(ids);
            outcome.tokens_saved += saved;
            if self.measured_tokens(messages, PassMode::Force) > sigma {
                self.state.lock().allow_compaction = true;
                outcome.latched_compaction = true;
                tracing::warn!(
                    turn = outcome.turn,
                    "still above the safety threshold after force pass; allowing host compaction"
                );
            }
        }

        outcome
    }

    fn measured_tokens(&self, messages: &[Message], mode: PassMode) -> u64 {
        let oracle = self.oracle.lock();
        match mode {
            PassMode::Normal => oracle::count_tokens(&oracle, messages),
            PassMode::Force => oracle::count_tokens_safe(&oracle, messages, DEFAULT_COVERAGE),
        }
    }

    // ── Phase 0 ───────────────────────────────────────────────────

    fn replace_known_stubs(&self, messages: &mut [Message]) {
        for message in messages.iter_mut() {
            if is_stub(message) {
                continue;
            }
            let fp = fingerprint(message);
            if let Some(id) = self.store.externalized_id(&fp) {
                if let Some(record) = self.store.get(&id) {
                    splice_stub(message, &record);
                }
            }
        }
    }

    // ── Phases 1 & 3 ──────────────────────────────────────────────

    fn externalize_pass(
        &self,
        messages: &mut [Message],
        threshold: u64,
        mode: PassMode,
    ) -> (Vec<String>, u64) {
        let newest_user = messages.iter().rposition(|m| m.role == Role::User);
        let newest_assistant = messages.iter().rposition(|m| m.role == Role::Assistant);

        let mut candidates: Vec<Group> = build_groups(messages)
            .into_iter()
            .filter(|group| {
                let protected = group
                    .indices
                    .iter()
                    .any(|&i| Some(i) == newest_user || Some(i) == newest_assistant);
                if protected {
                    return false;
                }
                if group.indices.iter().any(|&i| is_stub(&messages[i])) {
                    return false;
                }
                match mode {
                    PassMode::Normal => {
                        if group
                            .tool_call_ids
                            .iter()
                            .any(|id| self.warm.is_tool_call_warm(id))
                        {
                            return false;
                        }
                        // A group whose source record is still warm stays put.
                        !group.indices.iter().any(|&i| {
                            self.store
                                .externalized_id(&fingerprint(&messages[i]))
                                .is_some_and(|id| self.warm.is_warm(&id))
                        })
                    }
                    PassMode::Force => {
                        !group.indices.iter().any(|&i| messages[i].role == Role::System)
                    }
                }
            })
            .collect();

        // Tool-result-bearing groups first, then largest first.
        {
            let oracle = self.oracle.lock();
            for group in &mut candidates {
                let chars: u64 = group
                    .indices
                    .iter()
                    .map(|&i| oracle::message_chars(&messages[i]))
                    .sum();
                group.token_estimate = oracle.estimate(chars);
            }
        }
        candidates.sort_by(|a, b| {
            b.has_tool_results
                .cmp(&a.has_tool_results)
                .then(b.token_estimate.cmp(&a.token_estimate))
        });

        let mut externalized = Vec::new();
        let mut saved = 0u64;
        let mut queue = candidates.into_iter();
        while self.measured_tokens(messages, mode) > threshold {
            let Some(group) = queue.next() else {
                break;
            };
            for &idx in &group.indices {
                let message = &messages[idx];
                if is_stub(message) {
                    continue;
                }
                let fp = fingerprint(message);
                let record = match self.store.externalized_id(&fp).and_then(|id| self.store.get(&id)) {
                    Some(existing) => existing,
                    None => {
                        let content = render_message_content(message);
                        let token_estimate = self
                            .oracle
                            .lock()
                            .estimate(content.chars().count() as u64);
                        let record = self.store.add(NewRecord {
                            kind: if message.is_tool_result() {
                                ContentKind::ToolOutput
                            } else {
                                ContentKind::Conversation
                            },
                            description: describe(message),
                            token_estimate,
                            source: RecordSource::Externalized { fingerprint: fp },
                            content,
                        });
                        externalized.push(record.id.clone());
                        saved += record.token_estimate;
                        record
                    }
                };
                splice_stub(&mut messages[idx], &record);
            }
        }
        (externalized, saved)
    }

    // ── Phase 2 ───────────────────────────────────────────────────

    fn inject_manifest(&self, messages: &mut [Message], cfg: &RlmConfig) {
        if self.store.object_count() == 0 {
            return;
        }
        let Some(first_user) = messages.iter_mut().find(|m| m.role == Role::User) else {
            return;
        };
        if first_user
            .content
            .text()
            .is_some_and(|t| t.starts_with(MANIFEST_PREFIX))
        {
            return;
        }
        let manifest = build_manifest(&self.store.full_index(), cfg.manifest_budget);
        match &mut first_user.content {
            MessageContent::Parts(parts) => {
                parts.insert(0, ContentPart::Text { text: manifest });
            }
            MessageContent::Text(text) => {
                *text = format!("{manifest}\n\n{text}");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Atomic grouping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
struct Group {
    indices: Vec<usize>,
    /// Tool-call ids of the results actually present in the group.
    tool_call_ids: Vec<String>,
    has_tool_results: bool,
    token_estimate: u64,
}

/// Partition messages into atomic groups: an assistant carrying tool-use
/// blocks travels with every matching tool result; everything else is a
/// singleton. Orphan tool results are dropped from grouping entirely.
fn build_groups(messages: &[Message]) -> Vec<Group> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let message = &messages[i];
        if message.role == Role::Assistant && message.has_tool_use() {
            let expected: HashSet<&str> = message.tool_use_ids().into_iter().collect();
            let mut indices = vec![i];
            let mut tool_call_ids = Vec::new();
            let mut j = i + 1;
            while j < messages.len() {
                match messages[j].tool_result_id() {
                    Some(id) if expected.contains(id) => {
                        tool_call_ids.push(id.to_owned());
                        indices.push(j);
                        j += 1;
                    }
                    _ => break,
                }
            }
            groups.push(Group {
                has_tool_results: !tool_call_ids.is_empty(),
                indices,
                tool_call_ids,
                token_estimate: 0,
            });
            i = j;
        } else if message.is_tool_result() {
            // Orphan result, no matching assistant.
            i += 1;
        } else {
            groups.push(Group {
                indices: vec![i],
                tool_call_ids: Vec::new(),
                has_tool_results: false,
                token_estimate: 0,
            });
            i += 1;
        }
    }
    groups
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stubs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn stub_text(record: &ObjectRecord) -> String {
    format!(
        "{STUB_PREFIX} {id} | {kind} | {tokens} tokens | {description}]\nUse rlm_peek(\"{id}\") to view, or rlm_search to find specific content.",
        id = record.id,
        kind = record.kind.as_str(),
        tokens = record.token_estimate,
        description = record.description,
    )
}

pub fn is_stub(message: &Message) -> bool {
    message
        .content
        .text()
        .or_else(|| match &message.content {
            MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::ToolResult { content, .. } => Some(content.as_str()),
                _ => None,
            }),
            MessageContent::Text(t) => Some(t.as_str()),
        })
        .is_some_and(|t| t.starts_with(STUB_PREFIX))
}

/// Replace a message's content with the stub, preserving the block
/// structure the host protocol depends on: tool results keep their
/// tool_use_id, assistants keep their tool_use blocks after the stub.
fn splice_stub(message: &mut Message, record: &ObjectRecord) {
    let stub = stub_text(record);
    let content = match &message.content {
        MessageContent::Parts(parts) if message.is_tool_result() => MessageContent::Parts(
            parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolResult { tool_use_id, is_error, .. } => {
                        Some(ContentPart::ToolResult {
                            tool_use_id: tool_use_id.clone(),
                            content: stub.clone(),
                            is_error: *is_error,
                        })
                    }
                    _ => None,
                })
                .collect(),
        ),
        MessageContent::Parts(parts) if message.has_tool_use() => {
            let mut replaced = vec![ContentPart::Text { text: stub }];
            replaced.extend(parts.iter().filter_map(|p| match p {
                ContentPart::ToolUse { .. } => Some(p.clone()),
                _ => None,
            }));
            MessageContent::Parts(replaced)
        }
        _ => MessageContent::Text(stub),
    };
    message.content = content;
}

/// The record body for an externalized message.
fn render_message_content(message: &Message) -> String {
    match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.clone(),
                ContentPart::ToolUse { id, name, input } => {
                    format!("[tool_use {id} {name}: {input}]")
                }
                ContentPart::ToolResult { content, .. } => content.clone(),
                ContentPart::Image { .. } => "[image]".to_owned(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn describe(message: &Message) -> String {
    let text = message.content.extract_all_text();
    let snippet: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .take(DESCRIPTION_SNIPPET_CHARS)
        .collect();
    let label = match message.role {
        Role::Tool => "tool output",
        Role::Assistant => "assistant message",
        Role::User => "user message",
        Role::System => "system message",
    };
    format!("{label}: {}", snippet.trim())
}
