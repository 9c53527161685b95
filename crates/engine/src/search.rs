//! Store search: substring or regex with a hard wall-clock cap.
//!
//! Patterns written as `/body/flags` compile to a regex; anything else
//! (including a regex that fails to parse) searches as a plain substring.
//! Regex execution runs on a blocking thread under a 5-second timeout so
//! a pathological pattern cannot stall the session.

use std::sync::Arc;
use std::time::Duration;

use regex::RegexBuilder;
use serde::Serialize;

use rlm_store::ExternalStore;

/// Global and per-object cap on returned matches.
pub const MAX_MATCHES: usize = 50;
/// Characters of context kept on each side of a match.
pub const CONTEXT_CHARS: usize = 100;
/// Hard cap on regex execution.
pub const REGEX_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub object_id: String,
    /// Character offset of the match within the object.
    pub offset: usize,
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Substring(String),
    Regex(regex::Regex),
}

/// Parse `/body/flags` into a regex, falling back to substring search on
/// any parse failure. Recognized flags: `i`, `m`, `s` (`g` and `u` are
/// implied and accepted).
pub fn parse_pattern(raw: &str) -> Pattern {
    let fallback = || Pattern::Substring(raw.to_owned());
    let Some(rest) = raw.strip_prefix('/') else {
        return fallback();
    };
    let Some(close) = rest.rfind('/') else {
        return fallback();
    };
    let (body, flags) = rest.split_at(close);
    let flags = &flags[1..];
    if body.is_empty() || !flags.chars().all(|c| matches!(c, 'i' | 'm' | 's' | 'g' | 'u')) {
        return fallback();
    }

    let mut builder = RegexBuilder::new(body);
    builder
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'));
    match builder.build() {
        Ok(re) => Pattern::Regex(re),
        Err(e) => {
            tracing::debug!(pattern = raw, error = %e, "regex parse failed; using substring");
            fallback()
        }
    }
}

/// Substring scan, advancing past each match, capped per object.
pub fn substring_matches(object_id: &str, content: &str, needle: &str) -> Vec<SearchMatch> {
    let mut matches = Vec::new();
    if needle.is_empty() {
        return matches;
    }
    for (byte_idx, _) in content.match_indices(needle) {
        if matches.len() >= MAX_MATCHES {
            break;
        }
        matches.push(make_match(object_id, content, byte_idx, needle.len()));
    }
    matches
}

fn regex_matches_blocking(object_id: &str, content: &str, re: &regex::Regex) -> Vec<SearchMatch> {
    let mut matches = Vec::new();
    for m in re.find_iter(content) {
        if matches.len() >= MAX_MATCHES {
            break;
        }
        matches.push(make_match(object_id, content, m.start(), m.len()));
    }
    matches
}

fn make_match(object_id: &str, content: &str, byte_idx: usize, match_len: usize) -> SearchMatch {
    let start = back_chars(content, byte_idx, CONTEXT_CHARS);
    let end = fwd_chars(content, byte_idx + match_len, CONTEXT_CHARS);
    SearchMatch {
        object_id: object_id.to_owned(),
        offset: content[..byte_idx].chars().count(),
        context: content[start..end].to_owned(),
        error: None,
    }
}

fn back_chars(s: &str, byte_idx: usize, n: usize) -> usize {
    s[..byte_idx]
        .char_indices()
        .rev()
        .nth(n.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn fwd_chars(s: &str, byte_idx: usize, n: usize) -> usize {
    s[byte_idx..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| byte_idx + i)
        .unwrap_or(s.len())
}

/// Search one object with the parsed pattern. Regexes run on a blocking
/// thread; a timeout or worker failure yields one synthetic match with
/// the error attached so the caller can render it.
pub async fn search_object(object_id: &str, content: Arc<String>, pattern: &Pattern) -> Vec<SearchMatch> {
    match pattern {
        Pattern::Substring(needle) => substring_matches(object_id, &content, needle),
        Pattern::Regex(re) => {
            let re = re.clone();
            let id = object_id.to_owned();
            let task = tokio::task::spawn_blocking(move || {
                regex_matches_blocking(&id, &content, &re)
            });
            match tokio::time::timeout(REGEX_TIMEOUT, task).await {
                Ok(Ok(matches)) => matches,
                Ok(Err(join_err)) => vec![error_match(object_id, format!("search worker failed: {join_err}"))],
                Err(_) => vec![error_match(
                    object_id,
                    format!("regex search timed out after {}s", REGEX_TIMEOUT.as_secs()),
                )],
            }
        }
    }
}

fn error_match(object_id: &str, error: String) -> SearchMatch {
    SearchMatch {
        object_id: object_id.to_owned(),
        offset: 0,
        context: String::new(),
        error: Some(error),
    }
}

/// Search across the whole store or a subset of ids, capping the total at
/// [`MAX_MATCHES`]. Matched object ids are marked warm by the caller.
pub async fn search_store(
    store: &ExternalStore,
    scope: Option<&[String]>,
    raw_pattern: &str,
) -> Vec<SearchMatch> {
    let pattern = parse_pattern(raw_pattern);
    let ids: Vec<String> = match scope {
        Some(ids) => ids.to_vec(),
        None => store.all_ids(),
    };

    let mut all = Vec::new();
    for id in ids {
        if all.len() >= MAX_MATCHES {
            break;
        }
        let Some(record) = store.get(&id) else {
            continue;
        };
        let mut matches = search_object(&id, Arc::new(record.content), &pattern).await;
        let room = MAX_MATCHES - all.len();
        matches.truncate(room);
        all.append(&mut matches);
    }
    all
}
