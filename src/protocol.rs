//! Wire protocol: the closed command/event tagged unions exchanged with
//! clients over the gateway WebSocket.
//!
//! Inbound commands and outbound events both carry a `type` tag with dotted
//! names (`session.send`, `assistant.token`, ...). Payload fields use
//! camelCase on the wire. Parsing is strict: an unknown tag or a payload
//! that does not match its variant is a protocol error, answered with a
//! single `error` event and no state change.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Shared vocabulary
// =============================================================================

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Thinking,
    Streaming,
    ToolUse,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Thinking => "thinking",
            SessionStatus::Streaming => "streaming",
            SessionStatus::ToolUse => "tool_use",
            SessionStatus::Error => "error",
        }
    }

    /// A session in any of these states has a pipeline in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionStatus::Thinking | SessionStatus::Streaming | SessionStatus::ToolUse
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervised backend status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool call execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// How an inbound message picks its agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    Auto,
    Pinned,
}

/// One stream of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// Inline image attachment on `session.send`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    /// Base64-encoded image bytes
    pub data: String,

    /// MIME type, e.g. `image/png`
    #[serde(default = "default_media_type")]
    pub media_type: String,
}

fn default_media_type() -> String {
    "image/png".to_string()
}

/// Agent pack summary for `agent.list`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub name: String,
    pub description: String,
    pub tools: Vec<String>,
    pub max_tool_calls: u32,
}

// =============================================================================
// Commands (client -> server)
// =============================================================================

/// Inbound client command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    /// Create a session, optionally with a caller-chosen id
    #[serde(rename = "session.create", rename_all = "camelCase")]
    SessionCreate {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Send a user message into a session (created lazily if unknown)
    #[serde(rename = "session.send", rename_all = "camelCase")]
    SessionSend {
        session_id: String,
        content: String,
        #[serde(default)]
        images: Vec<ImageAttachment>,
    },

    /// Adjust routing mode, pinned agent, or session prompt
    #[serde(rename = "session.configure", rename_all = "camelCase")]
    SessionConfigure {
        session_id: String,
        #[serde(default)]
        routing_mode: Option<RoutingMode>,
        #[serde(default)]
        agent: Option<String>,
        #[serde(default)]
        session_prompt: Option<String>,
    },

    /// Return the session to idle (does not interrupt an in-flight stream)
    #[serde(rename = "session.cancel", rename_all = "camelCase")]
    SessionCancel { session_id: String },

    /// List the available agent packs
    #[serde(rename = "agent.list")]
    AgentList {},

    /// Start a supervised backend
    #[serde(rename = "service.start", rename_all = "camelCase")]
    ServiceStart { name: String },

    /// Stop a supervised backend
    #[serde(rename = "service.stop", rename_all = "camelCase")]
    ServiceStop { name: String },

    /// Report backend status (one name or all)
    #[serde(rename = "service.status", rename_all = "camelCase")]
    ServiceStatus {
        #[serde(default)]
        name: Option<String>,
    },

    /// Synthesize speech for a text through the TTS backend
    #[serde(rename = "tts.speak", rename_all = "camelCase")]
    TtsSpeak {
        text: String,
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Parse a raw client frame into a command.
pub fn parse_command(raw: &str) -> Result<ClientCommand> {
    serde_json::from_str(raw).map_err(|e| Error::Protocol(format!("invalid command: {e}")))
}

// =============================================================================
// Events (server -> clients)
// =============================================================================

/// Outbound server event, fanned out to every connected client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created", rename_all = "camelCase")]
    SessionCreated { session_id: String },

    #[serde(rename = "session.status", rename_all = "camelCase")]
    SessionStatus {
        session_id: String,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    #[serde(rename = "assistant.token", rename_all = "camelCase")]
    AssistantToken { session_id: String, token: String },

    #[serde(rename = "assistant.message", rename_all = "camelCase")]
    AssistantMessage {
        session_id: String,
        message_id: String,
        content: String,
    },

    #[serde(rename = "tool.call", rename_all = "camelCase")]
    ToolCall {
        session_id: String,
        id: String,
        name: String,
        args: serde_json::Value,
    },

    #[serde(rename = "tool.result", rename_all = "camelCase")]
    ToolResult {
        session_id: String,
        id: String,
        name: String,
        status: ToolCallStatus,
        result: serde_json::Value,
    },

    #[serde(rename = "router.decision", rename_all = "camelCase")]
    RouterDecision {
        session_id: String,
        agent: String,
        reason: String,
        tools: Vec<String>,
    },

    #[serde(rename = "agent.list", rename_all = "camelCase")]
    AgentList { agents: Vec<AgentSummary> },

    #[serde(rename = "service.status", rename_all = "camelCase")]
    ServiceStatus {
        name: String,
        status: ServiceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },

    #[serde(rename = "service.log", rename_all = "camelCase")]
    ServiceLog {
        name: String,
        stream: LogStream,
        line: String,
    },

    #[serde(rename = "perf.metric", rename_all = "camelCase")]
    PerfMetric {
        name: String,
        duration_ms: u64,
        meta: serde_json::Value,
    },

    #[serde(rename = "tts.audio", rename_all = "camelCase")]
    TtsAudio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        audio_base64: String,
        format: String,
    },

    #[serde(rename = "error", rename_all = "camelCase")]
    Error { error: String },
}

impl ServerEvent {
    /// Shorthand for the error event.
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            error: message.into(),
        }
    }

    /// Serialize for the wire. Serialization of these closed types cannot
    /// fail in practice; fall back to a bare error frame if it ever does.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","error":"serialization failure"}"#.to_string())
    }
}
