//! Side-effecting operations callable from the tool loop.
//!
//! Tools are named with dotted identifiers (`fs.read`, `time.now`) and take
//! JSON arguments. The model requests one by replying with a single
//! `TOOL_CALL: {json}` line; results are fed back as `TOOL_RESULT: {json}`
//! lines. Anything else in a reply is ordinary assistant text.

mod fs;
mod logo;
mod service;
mod time;

pub use fs::{FsListTool, FsReadTool};
pub use logo::LogoTool;
pub use service::ServiceStatusTool;
pub use time::TimeNowTool;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::supervisor::ServiceSupervisor;

/// Line prefix the model uses to request a tool call.
pub const TOOL_CALL_PREFIX: &str = "TOOL_CALL:";

/// Line prefix under which tool output is fed back to the model.
pub const TOOL_RESULT_PREFIX: &str = "TOOL_RESULT:";

/// One callable tool. Implementations are cheap to construct and safe to
/// call concurrently.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Dotted wire name, e.g. `fs.read`
    fn name(&self) -> &str;

    /// One-line description shown in the tool-catalog prompt
    fn description(&self) -> &str;

    /// Example arguments shown to the model
    fn args_hint(&self) -> &str;

    /// Check the argument shape without executing. The tool loop treats a
    /// failure here as "no call detected" and ends.
    fn validate_args(&self, args: &Value) -> Result<()>;

    /// Execute with the arguments from a `TOOL_CALL` line.
    async fn execute(&self, args: &Value) -> Result<Value>;
}

/// Parse tool arguments, treating a missing/`null` args object as empty.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T> {
    let value = if args.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        args.clone()
    };
    serde_json::from_value(value).map_err(|e| Error::Tool(format!("invalid args: {e}")))
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Find the first `TOOL_CALL:` line in a reply. A malformed payload counts
/// as no call at all, which ends the tool loop.
pub fn detect_tool_call(reply: &str) -> Option<ToolCallRequest> {
    for line in reply.lines() {
        let Some(payload) = line.trim().strip_prefix(TOOL_CALL_PREFIX) else {
            continue;
        };
        return match serde_json::from_str::<ToolCallRequest>(payload.trim()) {
            Ok(call) if !call.name.is_empty() => Some(call),
            _ => None,
        };
    }
    None
}

/// Remove tool-protocol lines from a reply before it reaches the user.
pub fn strip_protocol_lines(reply: &str) -> String {
    reply
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !trimmed.starts_with(TOOL_CALL_PREFIX) && !trimmed.starts_with(TOOL_RESULT_PREFIX)
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Registry of every tool the process knows about. Agents see only their
/// allow-listed subset.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the full built-in tool set.
    pub fn builtin(workspace_root: PathBuf, supervisor: Arc<ServiceSupervisor>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TimeNowTool::new()));
        registry.register(Arc::new(FsReadTool::new(workspace_root.clone())));
        registry.register(Arc::new(FsListTool::new(workspace_root)));
        registry.register(Arc::new(ServiceStatusTool::new(supervisor)));
        registry.register(Arc::new(LogoTool::new()));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Prompt fragment enumerating only the allow-listed tools, with the
    /// call protocol the model must follow.
    pub fn catalog_prompt(&self, allowed: &[String]) -> String {
        let mut lines = vec![
            "You can call tools. To call one, reply with a single line of exactly this form \
             and nothing else:"
                .to_string(),
            format!("{TOOL_CALL_PREFIX} {{\"name\": \"<tool>\", \"args\": {{...}}}}"),
            String::new(),
            "Available tools:".to_string(),
        ];
        for name in allowed {
            if let Some(tool) = self.tools.get(name) {
                lines.push(format!(
                    "- {}: {} Args: {}",
                    tool.name(),
                    tool.description(),
                    tool.args_hint()
                ));
            }
        }
        lines.push(String::new());
        lines.push(
            "Tool output arrives on a TOOL_RESULT line. When you have enough information, \
             answer the user normally without any TOOL_CALL line."
                .to_string(),
        );
        lines.join("\n")
    }
}
