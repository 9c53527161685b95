//! `rlm_stats`: one-screen summary of the session's RLM state.

use rlm_domain::Result;

use crate::host::ToolOutput;
use crate::session::RlmSession;

pub(crate) async fn execute(session: &RlmSession) -> Result<ToolOutput> {
    let store = session.store();
    let usage = session.host().context_usage();
    let tree = session.tree();

    let mut text = String::from("RLM statistics\n");
    text.push_str(&format!(
        "store: {} object(s), {} tokens, {} bytes on disk\n",
        store.object_count(),
        store.total_tokens(),
        store.disk_bytes(),
    ));
    match usage.tokens {
        Some(tokens) if usage.context_window > 0 => text.push_str(&format!(
            "context: {tokens}/{} tokens ({}%)\n",
            usage.context_window,
            tokens * 100 / usage.context_window,
        )),
        _ => text.push_str("context: usage not reported by host\n"),
    }

    let phases = session.active_phases();
    if phases.is_empty() {
        text.push_str("active phases: none\n");
    } else {
        text.push_str(&format!("active phases: {}\n", phases.join(", ")));
    }

    let active = tree.get_active();
    text.push_str(&format!(
        "child calls: {} active, max depth {}\n",
        active.len(),
        tree.max_active_depth(),
    ));
    if let Some(op) = tree.active_operation() {
        text.push_str(&format!(
            "operation {}: {} call(s), est ${:.4}, actual ${:.4}\n",
            op.id, op.child_calls, op.estimated_cost, op.actual_cost,
        ));
    }
    text.push_str(&format!(
        "warm objects: {}, turn {}\n",
        session.warm().warm_object_count(),
        session.externalizer().turn(),
    ));
    {
        let oracle = session.oracle().lock();
        text.push_str(&format!(
            "token oracle: {} observation(s), {}\n",
            oracle.observation_count(),
            if oracle.is_calibrated() { "calibrated" } else { "cold" },
        ));
    }
    Ok(ToolOutput::ok(text))
}
