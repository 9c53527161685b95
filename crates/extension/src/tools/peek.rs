//! `rlm_peek`: windowed retrieval of one stored object.

use serde::Deserialize;

use rlm_domain::{Error, Result};
use rlm_engine::engine::peek_slice;

use crate::host::ToolOutput;
use crate::session::RlmSession;

const DEFAULT_LENGTH: usize = 2000;

#[derive(Deserialize)]
struct PeekParams {
    id: String,
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_length")]
    length: usize,
}

fn default_length() -> usize {
    DEFAULT_LENGTH
}

pub(crate) async fn execute(
    session: &RlmSession,
    params: serde_json::Value,
    tool_call_id: &str,
) -> Result<ToolOutput> {
    let params: PeekParams = serde_json::from_value(params)
        .map_err(|e| Error::Parse(format!("invalid rlm_peek parameters: {e}")))?;
    if params.length == 0 {
        return Err(Error::Parse("length must be at least 1".into()));
    }

    let Some(record) = session.store().get(&params.id) else {
        return Ok(ToolOutput::error(format!("Object {} not found", params.id)));
    };

    let warm_turns = session.config().read().warm_turns;
    session.warm().mark_warm([params.id.clone()], warm_turns);
    session.warm().mark_tool_call_warm(tool_call_id, warm_turns);

    let text = peek_slice(&record.content, params.offset, params.length, &params.id);
    Ok(ToolOutput::ok(text).with_details(serde_json::json!({
        "id": record.id,
        "type": record.kind.as_str(),
        "tokens": record.token_estimate,
        "description": record.description,
    })))
}
