//! The child agent loop.
//!
//! Runs one child call: invoke the model, dispatch any tool calls it
//! makes against the shared store, and repeat until it answers in plain
//! text or the turn budget runs out. Cancellation and the wall-clock
//! deadline are checked around every model call.

use tokio_util::sync::CancellationToken;

use rlm_domain::message::{ContentPart, Message, MessageContent, Role, ToolDefinition};
use rlm_domain::Result;

use crate::engine::{ChildScope, RecursiveEngine};

/// Turn budget for one child loop.
pub const MAX_TURNS: u32 = 5;

const MAX_TURNS_FALLBACK: &str = "Reached maximum turns without a final answer.";

/// How a child loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEnd {
    /// The model answered without further tool calls.
    Completed,
    /// The cancellation token fired.
    Aborted,
    /// The wall-clock deadline passed.
    DeadlineExceeded,
    /// The turn budget ran out; `text` holds the last assistant text.
    MaxTurns,
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub end: LoopEnd,
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub turns: u32,
}

pub(crate) async fn run_child_loop(
    engine: &RecursiveEngine,
    scope: &ChildScope,
    model: &str,
    system_prompt: &str,
    mut messages: Vec<Message>,
    tools: Vec<ToolDefinition>,
    cancel: CancellationToken,
    deadline: tokio::time::Instant,
) -> Result<LoopOutcome> {
    let mut use_stream = false;
    let mut input_tokens = 0u64;
    let mut output_tokens = 0u64;
    let mut last_assistant_text = String::new();

    let outcome = |end: LoopEnd, text: String, tin: u64, tout: u64, turns: u32| LoopOutcome {
        end,
        text,
        input_tokens: tin,
        output_tokens: tout,
        turns,
    };

    for turn in 0..MAX_TURNS {
        if cancel.is_cancelled() {
            return Ok(outcome(
                LoopEnd::Aborted,
                last_assistant_text,
                input_tokens,
                output_tokens,
                turn,
            ));
        }

        let completion = loop {
            let request = crate::adapter::CompletionRequest {
                system_prompt: system_prompt.to_owned(),
                messages: messages.clone(),
                tools: tools.clone(),
            };
            let options = crate::adapter::CallOptions {
                max_tokens: engine.child_max_tokens(),
                cancel: cancel.clone(),
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(outcome(
                        LoopEnd::Aborted,
                        last_assistant_text,
                        input_tokens,
                        output_tokens,
                        turn,
                    ));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(outcome(
                        LoopEnd::DeadlineExceeded,
                        last_assistant_text,
                        input_tokens,
                        output_tokens,
                        turn,
                    ));
                }
                result = async {
                    if use_stream {
                        engine.adapter().stream(model, request, options).await
                    } else {
                        engine.adapter().complete(model, request, options).await
                    }
                } => result,
            };
            match result {
                Ok(completion) => break completion,
                Err(e) if !use_stream && e.is_unsupported() => {
                    tracing::info!(model, "non-streaming call unsupported; switching to stream");
                    use_stream = true;
                }
                Err(e) => return Err(e),
            }
        };

        input_tokens += completion.usage.input_tokens;
        output_tokens += completion.usage.output_tokens;

        let tool_calls = completion.tool_calls();
        let text = completion.text();
        if tool_calls.is_empty() {
            return Ok(outcome(
                LoopEnd::Completed,
                text,
                input_tokens,
                output_tokens,
                turn + 1,
            ));
        }
        if !text.is_empty() {
            last_assistant_text = text;
        }

        // Keep the assistant's blocks verbatim so tool_use / tool_result
        // pairing stays intact for the next call.
        messages.push(Message {
            role: Role::Assistant,
            content: MessageContent::Parts(completion.content.clone()),
            timestamp: None,
        });
        for tool_call in tool_calls {
            let (result_text, is_error) = engine
                .dispatch_child_tool(scope, &tool_call.tool_name, &tool_call.arguments)
                .await;
            messages.push(Message {
                role: Role::Tool,
                content: MessageContent::Parts(vec![ContentPart::ToolResult {
                    tool_use_id: tool_call.call_id,
                    content: result_text,
                    is_error,
                }]),
                timestamp: None,
            });
        }
    }

    let text = if last_assistant_text.is_empty() {
        MAX_TURNS_FALLBACK.to_owned()
    } else {
        last_assistant_text
    };
    Ok(outcome(LoopEnd::MaxTurns, text, input_tokens, output_tokens, MAX_TURNS))
}
