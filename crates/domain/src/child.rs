//! The structured result contract for recursive child calls.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// What a child call returns to its parent.
///
/// Children are instructed to answer with this JSON shape; anything that
/// fails to parse is wrapped verbatim with low confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildResult {
    pub answer: String,
    pub confidence: Confidence,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl ChildResult {
    /// Wrap an engine-side failure as a low-confidence result.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            answer: message.into(),
            confidence: Confidence::Low,
            evidence: Vec::new(),
        }
    }

    /// Parse a child's final text into the structured shape.
    ///
    /// Accepts a bare JSON object or one wrapped in a markdown code fence.
    /// On any mismatch the raw text becomes the answer with low confidence.
    pub fn parse(text: &str) -> Self {
        let candidate = strip_code_fence(text.trim());
        if let Ok(result) = serde_json::from_str::<ChildResult>(candidate) {
            return result;
        }
        Self {
            answer: text.trim().to_owned(),
            confidence: Confidence::Low,
            evidence: Vec::new(),
        }
    }
}

/// Strip a single surrounding ``` / ```json fence if present.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    match rest.rfind("```") {
        Some(end) => rest[..end].trim(),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let result = ChildResult::parse(
            r#"{"answer": "port 8080", "confidence": "high", "evidence": ["config.yaml:12"]}"#,
        );
        assert_eq!(result.answer, "port 8080");
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.evidence, vec!["config.yaml:12"]);
    }

    #[test]
    fn parses_fenced_json() {
        let text = "```json\n{\"answer\": \"yes\", \"confidence\": \"medium\"}\n```";
        let result = ChildResult::parse(text);
        assert_eq!(result.answer, "yes");
        assert_eq!(result.confidence, Confidence::Medium);
        assert!(result.evidence.is_empty());
    }

    #[test]
    fn wraps_unparseable_text_with_low_confidence() {
        let result = ChildResult::parse("the value was not found in the provided content");
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.answer.contains("not found"));
        assert!(result.evidence.is_empty());
    }

    #[test]
    fn wraps_malformed_json() {
        let result = ChildResult::parse(r#"{"answer": "partial"#);
        assert_eq!(result.confidence, Confidence::Low);
    }
}
