//! System prompt assembly for child calls.

/// Build the child system prompt from the caller's instructions and the
/// call's position in the recursion.
pub fn child_system_prompt(
    instructions: &str,
    depth: u32,
    max_depth: u32,
    can_recurse: bool,
) -> String {
    let mut prompt = String::from(
        "You are a focused sub-agent analyzing externalized content for a parent agent.\n\n",
    );
    prompt.push_str("Task:\n");
    prompt.push_str(instructions.trim());
    prompt.push_str("\n\n");

    prompt.push_str(
        "The user message contains the target content, objects separated by `---` lines.\n\
         You may call rlm_peek to view other stored objects and rlm_search to locate \
         specific content in the store.\n",
    );
    if can_recurse {
        prompt.push_str(
            "You may call rlm_query to delegate a narrower question about specific objects \
             to a deeper sub-agent; prefer answering directly when the content suffices.\n",
        );
    }
    prompt.push_str(&format!(
        "\nYou are at recursion depth {depth} of {max_depth}.\n",
    ));

    prompt.push_str(
        "\nAnswer with a single JSON object and nothing else:\n\
         {\"answer\": \"<your answer>\", \"confidence\": \"high\"|\"medium\"|\"low\", \
         \"evidence\": [\"<supporting excerpt or object id>\", ...]}\n\n\
         If the content does not contain the answer, say so in the answer field with low \
         confidence. Never invent content that is not present.",
    );
    prompt
}
