//! The `/rlm` slash command.
//!
//! Subcommands: status (no args), `on`, `off`, `cancel`, `config [k=v ...]`,
//! `inspect`, `externalize`, `store`.

use rlm_engine::calltree::CallView;

use crate::session::RlmSession;

pub(crate) async fn handle(session: &RlmSession, raw: &str) -> String {
    let mut parts = raw.trim().split_whitespace();
    match parts.next().unwrap_or("") {
        "" => status(session),
        "on" => {
            session.set_enabled(true);
            if session.store().is_healthy() {
                "RLM enabled.".to_owned()
            } else {
                "RLM enabled, but the store failed to initialize; externalization stays off."
                    .to_owned()
            }
        }
        "off" => {
            session.set_enabled(false);
            "RLM disabled. Running operations were cancelled; the store is preserved on disk."
                .to_owned()
        }
        "cancel" => {
            let cancelled = session.tree().abort_all();
            format!("Cancelled {cancelled} operation(s).")
        }
        "config" => config(session, parts.collect()),
        "inspect" => inspect(session),
        "externalize" => {
            session.externalizer().set_force_next();
            "Externalization will run on the next context turn.".to_owned()
        }
        "store" => store_listing(session),
        other => format!(
            "Unknown subcommand '{other}'. Usage: /rlm [on|off|cancel|config [k=v ...]|inspect|externalize|store]"
        ),
    }
}

fn status(session: &RlmSession) -> String {
    let store = session.store();
    let mut out = String::from("RLM status\n");
    out.push_str(&format!(
        "enabled: {} (store {})\n",
        session.is_enabled(),
        if store.is_healthy() { "healthy" } else { "degraded" },
    ));
    out.push_str(&format!(
        "store: {} object(s), {} tokens, {}\n",
        store.object_count(),
        store.total_tokens(),
        store.dir().display(),
    ));
    out.push_str(&format!(
        "turn: {}, warm objects: {}, compaction latch: {}\n",
        session.externalizer().turn(),
        session.warm().warm_object_count(),
        session.externalizer().allow_compaction(),
    ));
    out.push_str("\nconfig:\n");
    out.push_str(&session.config().read().render());
    out
}

fn config(session: &RlmSession, pairs: Vec<&str>) -> String {
    if pairs.is_empty() {
        return session.config().read().render();
    }
    let mut out = String::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            out.push_str(&format!("'{pair}': expected key=value\n"));
            continue;
        };
        let applied = session.config().write().apply_kv(key, value);
        match applied {
            Ok(()) => {
                if key == "maxChildCalls" {
                    session
                        .tree()
                        .set_max_child_calls(session.config().read().max_child_calls);
                }
                session.host().append_entry(
                    "rlm-config",
                    serde_json::json!({ "key": key, "value": value }),
                );
                out.push_str(&format!("{key}={value}\n"));
            }
            Err(e) => out.push_str(&format!("{e}\n")),
        }
    }
    out
}

fn inspect(session: &RlmSession) -> String {
    let views = session.tree().snapshot();
    if views.is_empty() {
        return "No child calls recorded this session.".to_owned();
    }
    let mut out = String::from("call tree:\n");
    for view in &views {
        render_call(view, 0, &mut out);
    }
    if let Some(op) = session.tree().active_operation() {
        out.push_str(&format!(
            "\nactive operation {}: {} call(s), est ${:.4}, actual ${:.4}\n",
            op.id, op.child_calls, op.estimated_cost, op.actual_cost,
        ));
    }
    out
}

fn render_call(view: &CallView, indent: usize, out: &mut String) {
    let node = &view.node;
    out.push_str(&format!(
        "{}{} [{}] depth={} model={} tokens={}/{}{} | {}\n",
        "  ".repeat(indent),
        node.id,
        node.status.as_str(),
        node.depth,
        node.model,
        node.input_tokens,
        node.output_tokens,
        node.duration_ms
            .map(|ms| format!(" {ms}ms"))
            .unwrap_or_default(),
        node.instructions,
    ));
    for child in &view.nested {
        render_call(child, indent + 1, out);
    }
}

fn store_listing(session: &RlmSession) -> String {
    let index = session.store().full_index();
    if index.entries.is_empty() {
        return "The store is empty.".to_owned();
    }
    let mut out = format!(
        "{} object(s), {} tokens:\n",
        index.entries.len(),
        index.total_tokens
    );
    for entry in &index.entries {
        out.push_str(&format!(
            "- {} | {} | {} tokens | {}\n",
            entry.id,
            entry.kind.as_str(),
            entry.token_estimate,
            entry.description,
        ));
    }
    out
}
