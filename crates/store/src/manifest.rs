//! Budgeted manifest of the store index, injected into working context.
//!
//! Newest records get full table rows until the budget runs out; the rest
//! collapse into a single `+N older` summary line, so the manifest stays
//! small no matter how large the store grows.

use rlm_domain::record::{IndexEntry, StoreIndex};

const HEADER: &str = "## External Store Manifest\n\n| id | type | tokens | description |\n|---|---|---|---|\n";
const EMPTY: &str = "## External Store Manifest\n\nNo externalized content yet.\n";
const MAX_DESCRIPTION_CHARS: usize = 60;

/// Render the manifest within `budget_tokens` (counting listed rows only).
pub fn build_manifest(index: &StoreIndex, budget_tokens: u64) -> String {
    if index.entries.is_empty() {
        return EMPTY.to_owned();
    }

    let mut newest_first: Vec<&IndexEntry> = index.entries.iter().collect();
    newest_first.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut rows = String::new();
    let mut spent = 0u64;
    let mut listed = 0usize;
    for entry in &newest_first {
        let row = format!(
            "| {} | {} | {} | {} |\n",
            entry.id,
            entry.kind.as_str(),
            entry.token_estimate,
            sanitize(&entry.description),
        );
        let cost = (row.chars().count() as u64).div_ceil(4);
        if spent + cost > budget_tokens {
            break;
        }
        spent += cost;
        rows.push_str(&row);
        listed += 1;
    }

    let mut out = String::from(HEADER);
    out.push_str(&rows);
    if listed < newest_first.len() {
        let older = &newest_first[listed..];
        let older_tokens: u64 = older.iter().map(|e| e.token_estimate).sum();
        out.push_str(&format!("+{} older | {} tokens\n", older.len(), older_tokens));
    }
    out.push_str(&format!(
        "\n{} objects, {} tokens externalized. Use rlm_peek(\"<id>\") to view, rlm_search to find content.\n",
        index.entries.len(),
        index.total_tokens,
    ));
    out
}

/// Single-line, table-safe, bounded description cell.
fn sanitize(description: &str) -> String {
    let flat: String = description
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            '|' => '/',
            c => c,
        })
        .collect();
    if flat.chars().count() <= MAX_DESCRIPTION_CHARS {
        return flat;
    }
    let truncated: String = flat.chars().take(MAX_DESCRIPTION_CHARS).collect();
    format!("{truncated}…")
}
