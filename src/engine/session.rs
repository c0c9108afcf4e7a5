//! Per-session state: status, routing configuration, and the append-only
//! message transcript.

use chrono::{DateTime, Utc};

use crate::llm::{ChatMessage, ChatRole};
use crate::protocol::{RoutingMode, SessionStatus, ToolCallStatus};

/// One transcript entry. Entries are only ever appended.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// One executed tool call, recorded on the owning session after its single
/// synchronous execution settles.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
    pub status: ToolCallStatus,
    pub result: Option<serde_json::Value>,
}

impl Message {
    fn new(role: ChatRole, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Utc::now(),
        }
    }
}

/// One conversation. Created explicitly via `session.create` or lazily on
/// first `session.send`.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub routing_mode: RoutingMode,
    /// Agent used while `routing_mode` is pinned
    pub pinned_agent: Option<String>,
    /// Extra system prompt text appended for every request in this session
    pub session_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Idle,
            routing_mode: RoutingMode::Auto,
            pinned_agent: None,
            session_prompt: None,
            messages: Vec::new(),
            tool_calls: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn append_user(&mut self, content: impl Into<String>) -> &Message {
        self.messages
            .push(Message::new(ChatRole::User, content.into()));
        // Just pushed, so the vec is non-empty.
        &self.messages[self.messages.len() - 1]
    }

    pub fn append_assistant(&mut self, content: impl Into<String>) -> &Message {
        self.messages
            .push(Message::new(ChatRole::Assistant, content.into()));
        &self.messages[self.messages.len() - 1]
    }

    /// The last `turns` transcript entries as chat messages, oldest first.
    pub fn recent_history(&self, turns: usize) -> Vec<ChatMessage> {
        let start = self.messages.len().saturating_sub(turns);
        self.messages[start..]
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: crate::llm::ChatContent::Text(m.content.clone()),
            })
            .collect()
    }
}
