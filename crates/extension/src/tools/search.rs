//! `rlm_search`: substring/regex search across the store.

use serde::Deserialize;

use rlm_domain::events::RlmEvent;
use rlm_domain::{Error, Result};
use rlm_engine::search::search_store;

use crate::host::ToolOutput;
use crate::session::RlmSession;

#[derive(Deserialize)]
struct SearchParams {
    pattern: String,
    #[serde(default)]
    scope: Option<ScopeParam>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScopeParam {
    All(String),
    Ids(Vec<String>),
}

pub(crate) async fn execute(
    session: &RlmSession,
    params: serde_json::Value,
    tool_call_id: &str,
) -> Result<ToolOutput> {
    let params: SearchParams = serde_json::from_value(params)
        .map_err(|e| Error::Parse(format!("invalid rlm_search parameters: {e}")))?;
    let _phase = session.enter_phase("search");

    let scope_ids = match params.scope {
        Some(ScopeParam::Ids(ids)) => Some(ids),
        _ => None,
    };
    let matches = search_store(session.store(), scope_ids.as_deref(), &params.pattern).await;

    let warm_turns = session.config().read().warm_turns;
    session
        .warm()
        .mark_warm(matches.iter().map(|m| m.object_id.clone()), warm_turns);
    session.warm().mark_tool_call_warm(tool_call_id, warm_turns);
    session.emit(RlmEvent::Search {
        pattern: params.pattern.clone(),
        matches: matches.len(),
    });

    if matches.is_empty() {
        return Ok(ToolOutput::ok(format!(
            "No matches for '{}' in the store.",
            params.pattern
        )));
    }

    let mut out = format!("{} match(es) for '{}':\n", matches.len(), params.pattern);
    for m in &matches {
        match &m.error {
            Some(error) => out.push_str(&format!("- {}: search error: {error}\n", m.object_id)),
            None => out.push_str(&format!(
                "- {} @ {}: …{}…\n",
                m.object_id,
                m.offset,
                m.context.replace('\n', " ")
            )),
        }
    }
    Ok(ToolOutput::ok(out))
}
