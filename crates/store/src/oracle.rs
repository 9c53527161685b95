//! Self-calibrating chars → tokens estimator.
//!
//! The oracle watches `(chars, tokens)` pairs reported by the host and
//! learns the session's actual character-per-token ratio. Until enough
//! observations arrive it falls back to the usual 4-chars-per-token rule
//! (3 for the safe bound). Safe estimates divide by a low quantile of the
//! observed ratios so they cover the requested fraction of past turns.

use std::collections::VecDeque;

use rlm_domain::message::Message;

/// Sliding-window capacity; older observations are evicted FIFO.
pub const WINDOW_CAP: usize = 200;
/// Observations required before the learned ratio is trusted.
pub const MIN_OBSERVATIONS: usize = 10;
/// Default coverage for safe estimates.
pub const DEFAULT_COVERAGE: f64 = 0.95;

/// Flat token surcharge per image block in the safe counter.
const IMAGE_TOKEN_SURCHARGE: u64 = 1000;

#[derive(Debug, Clone, Copy)]
struct Observation {
    chars: f64,
    tokens: f64,
}

#[derive(Debug, Default)]
pub struct TokenOracle {
    window: VecDeque<Observation>,
}

impl TokenOracle {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW_CAP),
        }
    }

    /// Record one `(chars, tokens)` pair. Non-positive inputs are ignored.
    pub fn observe(&mut self, chars: u64, tokens: u64) {
        if chars == 0 || tokens == 0 {
            return;
        }
        if self.window.len() == WINDOW_CAP {
            self.window.pop_front();
        }
        self.window.push_back(Observation {
            chars: chars as f64,
            tokens: tokens as f64,
        });
    }

    pub fn is_calibrated(&self) -> bool {
        self.window.len() >= MIN_OBSERVATIONS
    }

    pub fn observation_count(&self) -> usize {
        self.window.len()
    }

    fn mean_ratio(&self) -> f64 {
        let sum: f64 = self.window.iter().map(|o| o.chars / o.tokens).sum();
        sum / self.window.len() as f64
    }

    /// The `q`-quantile (0..=1) of observed chars-per-token ratios.
    fn ratio_quantile(&self, q: f64) -> f64 {
        let mut ratios: Vec<f64> = self.window.iter().map(|o| o.chars / o.tokens).collect();
        ratios.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = (q.clamp(0.0, 1.0) * (ratios.len() - 1) as f64).floor() as usize;
        ratios[idx].max(f64::EPSILON)
    }

    /// Point estimate of the token count for `chars` characters.
    pub fn estimate(&self, chars: u64) -> u64 {
        if !self.is_calibrated() {
            return chars.div_ceil(4);
        }
        (chars as f64 / self.mean_ratio()).ceil() as u64
    }

    /// Conservative estimate at the given coverage. Always ≥ the point
    /// estimate, and non-decreasing in `coverage`.
    pub fn estimate_safe(&self, chars: u64, coverage: f64) -> u64 {
        if !self.is_calibrated() {
            return chars.div_ceil(3).max(self.estimate(chars));
        }
        let low_ratio = self.ratio_quantile(1.0 - coverage.clamp(0.0, 1.0));
        let safe = (chars as f64 / low_ratio).ceil() as u64;
        safe.max(self.estimate(chars))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message-level counters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Character count of one message's text content (non-text blocks are
/// not measured by the point counter).
pub fn message_chars(message: &Message) -> u64 {
    message.content.extract_all_text().chars().count() as u64
}

pub fn total_chars(messages: &[Message]) -> u64 {
    messages.iter().map(message_chars).sum()
}

/// Point token estimate for a whole message list.
pub fn count_tokens(oracle: &TokenOracle, messages: &[Message]) -> u64 {
    oracle.estimate(total_chars(messages))
}

/// Safe token estimate: conformal character bound plus a flat surcharge
/// per image block.
pub fn count_tokens_safe(oracle: &TokenOracle, messages: &[Message], coverage: f64) -> u64 {
    let images: u64 = messages
        .iter()
        .map(|m| m.content.image_count() as u64)
        .sum();
    oracle.estimate_safe(total_chars(messages), coverage) + images * IMAGE_TOKEN_SURCHARGE
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlm_domain::message::{ContentPart, MessageContent, Role};

    #[test]
    fn cold_estimates_use_fixed_ratios() {
        let oracle = TokenOracle::new();
        assert_eq!(oracle.estimate(400), 100);
        assert_eq!(oracle.estimate(401), 101);
        assert_eq!(oracle.estimate_safe(300, DEFAULT_COVERAGE), 100);
        assert!(!oracle.is_calibrated());
    }

    #[test]
    fn invalid_observations_are_ignored() {
        let mut oracle = TokenOracle::new();
        oracle.observe(0, 50);
        oracle.observe(100, 0);
        assert_eq!(oracle.observation_count(), 0);
    }

    #[test]
    fn warm_estimate_tracks_observed_ratio() {
        let mut oracle = TokenOracle::new();
        // A steady 5 chars per token.
        for _ in 0..20 {
            oracle.observe(500, 100);
        }
        assert!(oracle.is_calibrated());
        assert_eq!(oracle.estimate(1000), 200);
    }

    #[test]
    fn safe_is_at_least_point_and_monotone_in_coverage() {
        let mut oracle = TokenOracle::new();
        // Ratios spread between 3 and 6 chars/token.
        for i in 0..30u64 {
            let tokens = 100;
            let chars = 300 + (i % 4) * 100;
            oracle.observe(chars, tokens);
        }
        let point = oracle.estimate(10_000);
        let safe_50 = oracle.estimate_safe(10_000, 0.5);
        let safe_95 = oracle.estimate_safe(10_000, 0.95);
        assert!(safe_50 >= point);
        assert!(safe_95 >= safe_50);
    }

    #[test]
    fn window_is_bounded() {
        let mut oracle = TokenOracle::new();
        for _ in 0..(WINDOW_CAP + 50) {
            oracle.observe(400, 100);
        }
        assert_eq!(oracle.observation_count(), WINDOW_CAP);
    }

    #[test]
    fn counters_sum_text_and_surcharge_images() {
        let oracle = TokenOracle::new();
        let messages = vec![
            Message::user("a".repeat(400)),
            Message {
                role: Role::User,
                content: MessageContent::Parts(vec![
                    ContentPart::Text { text: "b".repeat(400) },
                    ContentPart::Image { url: "data:x".into(), media_type: None },
                ]),
                timestamp: None,
            },
        ];
        assert_eq!(count_tokens(&oracle, &messages), 200);
        // Safe: ceil(800/3) + 1000 image surcharge.
        assert_eq!(
            count_tokens_safe(&oracle, &messages, DEFAULT_COVERAGE),
            267 + 1000
        );
    }
}
