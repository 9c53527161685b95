//! Dollar cost estimation for operations.
//!
//! Estimates are computed up front from target token counts; actuals are
//! accumulated onto the owning operation as each child call reports its
//! usage.

use std::collections::HashMap;

use rlm_domain::config::ModelPricing;

/// Fixed per-call input overhead (system prompt + tool schemas).
pub const CALL_OVERHEAD_TOKENS: u64 = 1000;

/// Up-front estimate for one operation.
#[derive(Debug, Clone, Copy)]
pub struct CostEstimate {
    pub calls: u32,
    pub cost_per_call: f64,
}

impl CostEstimate {
    pub fn total(&self) -> f64 {
        self.calls as f64 * self.cost_per_call
    }
}

/// Per-model pricing table with the child output cap baked in.
#[derive(Debug, Clone, Default)]
pub struct CostEstimator {
    pricing: HashMap<String, ModelPricing>,
}

impl CostEstimator {
    pub fn new(pricing: HashMap<String, ModelPricing>) -> Self {
        Self { pricing }
    }

    fn price(&self, model: &str) -> ModelPricing {
        match self.pricing.get(model) {
            Some(p) => *p,
            None => {
                tracing::debug!(model, "no pricing for model; estimating $0");
                ModelPricing::default()
            }
        }
    }

    /// A query is one call over the joined targets, plus one expected
    /// recursive call when depth allows it.
    pub fn estimate_query(
        &self,
        target_tokens: &[u64],
        depth: u32,
        max_out: u32,
        model: &str,
    ) -> CostEstimate {
        let calls = 1 + u32::from(depth > 1);
        let input: u64 = target_tokens.iter().sum::<u64>() + CALL_OVERHEAD_TOKENS;
        CostEstimate {
            calls,
            cost_per_call: self.price(model).cost(input, max_out as u64),
        }
    }

    /// A batch is one call per target, each seeing the average target size.
    pub fn estimate_batch(
        &self,
        target_tokens: &[u64],
        _depth: u32,
        max_out: u32,
        model: &str,
    ) -> CostEstimate {
        let calls = target_tokens.len() as u32;
        let avg = if target_tokens.is_empty() {
            0
        } else {
            target_tokens.iter().sum::<u64>() / target_tokens.len() as u64
        };
        CostEstimate {
            calls,
            cost_per_call: self.price(model).cost(avg + CALL_OVERHEAD_TOKENS, max_out as u64),
        }
    }

    /// Dollar cost of one completed call.
    pub fn add_call_cost(&self, tokens_in: u64, tokens_out: u64, model: &str) -> f64 {
        self.price(model).cost(tokens_in, tokens_out)
    }
}
