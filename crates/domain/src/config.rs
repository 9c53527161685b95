use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// All recognized RLM settings.
///
/// Field keys accepted by `/rlm config k=v` use the host-facing camelCase
/// spellings (see [`RlmConfig::apply_kv`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlmConfig {
    /// Master switch.
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Child recursion ceiling.
    #[serde(default = "d_2")]
    pub max_depth: u32,
    /// Batch parallelism.
    #[serde(default = "d_4")]
    pub max_concurrency: usize,
    /// Phase-1 trigger: externalize when usage exceeds this % of the window.
    #[serde(default = "d_60")]
    pub token_budget_percent: u32,
    /// Phase-3 trigger: force-externalize when usage exceeds this %.
    #[serde(default = "d_90")]
    pub safety_valve_percent: u32,
    /// Token budget for the injected manifest table.
    #[serde(default = "d_2000")]
    pub manifest_budget: u64,
    /// How many `context` turns a retrieved object stays warm.
    #[serde(default = "d_3")]
    pub warm_turns: u32,
    /// Wall-clock bound on one child agent loop, in seconds.
    #[serde(default = "d_120")]
    pub child_timeout_sec: u64,
    /// Wall-clock bound on a whole operation at the tool boundary.
    #[serde(default = "d_600")]
    pub operation_timeout_sec: u64,
    /// Per-operation cap on child calls.
    #[serde(default = "d_50")]
    pub max_child_calls: u32,
    /// Max output tokens per child completion.
    #[serde(default = "d_4096")]
    pub child_max_tokens: u32,
    /// Purge session directories older than this many days at startup.
    #[serde(default = "d_30")]
    pub retention_days: u32,
    /// Refuse ingestion when a glob expands to more files than this.
    #[serde(default = "d_1000")]
    pub max_ingest_files: usize,
    /// Stop ingesting once this many bytes have been stored.
    #[serde(default = "d_100mb")]
    pub max_ingest_bytes: u64,
    /// Optional model override for child calls. `None` = host session model.
    #[serde(default)]
    pub child_model: Option<String>,
    /// Per-model $ per million tokens, for operation cost estimates.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 2,
            max_concurrency: 4,
            token_budget_percent: 60,
            safety_valve_percent: 90,
            manifest_budget: 2000,
            warm_turns: 3,
            child_timeout_sec: 120,
            operation_timeout_sec: 600,
            max_child_calls: 50,
            child_max_tokens: 4096,
            retention_days: 30,
            max_ingest_files: 1000,
            max_ingest_bytes: 100 * 1024 * 1024,
            child_model: None,
            pricing: HashMap::new(),
        }
    }
}

/// Dollar cost per million input/output tokens for one model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPricing {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_mtok
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_mtok
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Key-value mutation surface (`/rlm config k=v`)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl RlmConfig {
    /// Host-facing keys accepted by [`apply_kv`](Self::apply_kv).
    pub const KEYS: &'static [&'static str] = &[
        "enabled",
        "maxDepth",
        "maxConcurrency",
        "tokenBudgetPercent",
        "safetyValvePercent",
        "manifestBudget",
        "warmTurns",
        "childTimeoutSec",
        "operationTimeoutSec",
        "maxChildCalls",
        "childMaxTokens",
        "retentionDays",
        "maxIngestFiles",
        "maxIngestBytes",
        "childModel",
    ];

    /// Apply one validated `key=value` assignment.
    ///
    /// Unknown keys and wrong types are rejected with a config error.
    /// `childModel=default` (or an empty value) clears the override.
    pub fn apply_kv(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "enabled" => self.enabled = parse_bool(key, value)?,
            "maxDepth" => self.max_depth = parse_num(key, value, 1, 10)?,
            "maxConcurrency" => self.max_concurrency = parse_num(key, value, 1, 64)? as usize,
            "tokenBudgetPercent" => self.token_budget_percent = parse_num(key, value, 1, 100)?,
            "safetyValvePercent" => self.safety_valve_percent = parse_num(key, value, 1, 100)?,
            "manifestBudget" => self.manifest_budget = parse_num(key, value, 1, 1_000_000)? as u64,
            "warmTurns" => self.warm_turns = parse_num(key, value, 0, 1000)?,
            "childTimeoutSec" => self.child_timeout_sec = parse_num(key, value, 1, 86_400)? as u64,
            "operationTimeoutSec" => {
                self.operation_timeout_sec = parse_num(key, value, 1, 86_400)? as u64
            }
            "maxChildCalls" => self.max_child_calls = parse_num(key, value, 1, 100_000)?,
            "childMaxTokens" => self.child_max_tokens = parse_num(key, value, 1, 1_000_000)?,
            "retentionDays" => self.retention_days = parse_num(key, value, 0, 10_000)?,
            "maxIngestFiles" => self.max_ingest_files = parse_num(key, value, 1, 1_000_000)? as usize,
            "maxIngestBytes" => {
                self.max_ingest_bytes = parse_num(key, value, 1, u32::MAX)? as u64
            }
            "childModel" => {
                self.child_model = match value {
                    "" | "default" => None,
                    other => Some(other.to_owned()),
                }
            }
            unknown => {
                return Err(Error::Config(format!(
                    "unknown config key '{unknown}' (known: {})",
                    Self::KEYS.join(", ")
                )))
            }
        }
        Ok(())
    }

    /// One-line-per-key rendering for the `/rlm` status output.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("enabled={}\n", self.enabled));
        out.push_str(&format!("maxDepth={}\n", self.max_depth));
        out.push_str(&format!("maxConcurrency={}\n", self.max_concurrency));
        out.push_str(&format!("tokenBudgetPercent={}\n", self.token_budget_percent));
        out.push_str(&format!("safetyValvePercent={}\n", self.safety_valve_percent));
        out.push_str(&format!("manifestBudget={}\n", self.manifest_budget));
        out.push_str(&format!("warmTurns={}\n", self.warm_turns));
        out.push_str(&format!("childTimeoutSec={}\n", self.child_timeout_sec));
        out.push_str(&format!("operationTimeoutSec={}\n", self.operation_timeout_sec));
        out.push_str(&format!("maxChildCalls={}\n", self.max_child_calls));
        out.push_str(&format!("childMaxTokens={}\n", self.child_max_tokens));
        out.push_str(&format!("retentionDays={}\n", self.retention_days));
        out.push_str(&format!("maxIngestFiles={}\n", self.max_ingest_files));
        out.push_str(&format!("maxIngestBytes={}\n", self.max_ingest_bytes));
        out.push_str(&format!(
            "childModel={}\n",
            self.child_model.as_deref().unwrap_or("default")
        ));
        out
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

fn parse_num(key: &str, value: &str, min: u32, max: u32) -> Result<u32> {
    let n: u32 = value
        .parse()
        .map_err(|_| Error::Config(format!("{key}: expected a number, got '{value}'")))?;
    if n < min || n > max {
        return Err(Error::Config(format!(
            "{key}: {n} is out of range [{min}, {max}]"
        )));
    }
    Ok(n)
}

// serde default helpers
fn d_true() -> bool { true }
fn d_2() -> u32 { 2 }
fn d_3() -> u32 { 3 }
fn d_4() -> usize { 4 }
fn d_30() -> u32 { 30 }
fn d_50() -> u32 { 50 }
fn d_60() -> u32 { 60 }
fn d_90() -> u32 { 90 }
fn d_120() -> u64 { 120 }
fn d_600() -> u64 { 600 }
fn d_1000() -> usize { 1000 }
fn d_2000() -> u64 { 2000 }
fn d_4096() -> u32 { 4096 }
fn d_100mb() -> u64 { 100 * 1024 * 1024 }
