//! Bounded tool-call loop.
//!
//! Runs buffered completions until the model answers without a `TOOL_CALL`
//! line or the agent's iteration budget runs out. Each executed call is
//! announced with `tool.call`/`tool.result` events and fed back to the model
//! as a `TOOL_RESULT` system turn; execution failures become structured
//! failed results and never abort the loop.

use serde_json::json;
use tokio::sync::broadcast;

use crate::agents::AgentPack;
use crate::engine::session::ToolCallRecord;
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionOptions, LlmClient};
use crate::protocol::{ServerEvent, ToolCallStatus};
use crate::tools::{detect_tool_call, strip_protocol_lines, ToolRegistry, TOOL_RESULT_PREFIX};

/// Terminal result of a tool loop run.
#[derive(Debug, Clone)]
pub struct ToolLoopOutcome {
    /// Final assistant text with tool-protocol lines stripped
    pub content: String,
    /// Model the backend reports for the final completion
    pub model: String,
    /// Executed calls with their settled status, in execution order
    pub calls: Vec<ToolCallRecord>,
}

/// Drive the loop to a terminal reply.
///
/// A reply that requests an unknown, disallowed, or malformed call counts as
/// terminal: the request line is dropped and the remaining text returned.
pub async fn run_tool_loop(
    client: &LlmClient,
    registry: &ToolRegistry,
    pack: &AgentPack,
    mut messages: Vec<ChatMessage>,
    options: &CompletionOptions,
    session_id: &str,
    events: &broadcast::Sender<ServerEvent>,
) -> Result<ToolLoopOutcome> {
    let mut calls: Vec<ToolCallRecord> = Vec::new();

    loop {
        let completion = client.complete(&messages, options).await?;

        let Some(call) = detect_tool_call(&completion.content) else {
            tracing::debug!(
                session_id = %session_id,
                agent = %pack.name,
                tool_calls = calls.len(),
                "tool loop reached terminal reply"
            );
            return Ok(outcome(completion, calls));
        };

        if calls.len() as u32 >= pack.max_tool_calls {
            tracing::warn!(
                session_id = %session_id,
                agent = %pack.name,
                budget = pack.max_tool_calls,
                "tool budget exhausted, returning last reply"
            );
            return Ok(outcome(completion, calls));
        }

        let allowed = pack.tools.iter().any(|t| t == &call.name);
        let Some(tool) = registry.get(&call.name).filter(|_| allowed) else {
            tracing::debug!(
                session_id = %session_id,
                agent = %pack.name,
                tool = %call.name,
                "requested tool not available to this agent"
            );
            return Ok(outcome(completion, calls));
        };
        if let Err(e) = tool.validate_args(&call.args) {
            tracing::debug!(
                session_id = %session_id,
                tool = %call.name,
                error = %e,
                "malformed tool arguments"
            );
            return Ok(outcome(completion, calls));
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        let _ = events.send(ServerEvent::ToolCall {
            session_id: session_id.to_string(),
            id: call_id.clone(),
            name: call.name.clone(),
            args: call.args.clone(),
        });

        let (status, result) = match tool.execute(&call.args).await {
            Ok(value) => (ToolCallStatus::Completed, value),
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    tool = %call.name,
                    error = %e,
                    "tool execution failed"
                );
                (ToolCallStatus::Failed, json!({ "error": e.to_string() }))
            }
        };
        let _ = events.send(ServerEvent::ToolResult {
            session_id: session_id.to_string(),
            id: call_id.clone(),
            name: call.name.clone(),
            status,
            result: result.clone(),
        });
        calls.push(ToolCallRecord {
            id: call_id,
            name: call.name.clone(),
            args: call.args.clone(),
            status,
            result: Some(result.clone()),
        });

        let feedback = json!({
            "name": call.name,
            "status": status,
            "result": result,
        });
        messages.push(ChatMessage::assistant(&completion.content));
        messages.push(ChatMessage::system(format!(
            "{TOOL_RESULT_PREFIX} {feedback}"
        )));
    }
}

fn outcome(completion: crate::llm::Completion, calls: Vec<ToolCallRecord>) -> ToolLoopOutcome {
    ToolLoopOutcome {
        content: strip_protocol_lines(&completion.content),
        model: completion.model,
        calls,
    }
}
