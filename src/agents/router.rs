//! Heuristic message routing.
//!
//! A message is matched, lower-cased, against ordered keyword sets. Debug
//! signals outrank architecture signals, which outrank code-change signals;
//! code-change signals only count when a scope word co-occurs. No signal
//! routes to the default conversational agent.

use crate::agents::AgentPack;

/// Words that indicate something is broken.
const DEBUG_KEYWORDS: &[&str] = &[
    "debug",
    "stack trace",
    "traceback",
    "backtrace",
    "error",
    "panic",
    "crash",
    "exception",
    "failing",
    "broken",
    "segfault",
];

/// Words that indicate a structural or design question.
const ARCHITECTURE_KEYWORDS: &[&str] = &[
    "architecture",
    "architect",
    "design",
    "structure",
    "refactor",
    "layering",
    "boundary",
    "dependency",
    "tradeoff",
    "trade-off",
];

/// Words that indicate a requested change. They only route to the coder when
/// a scope word narrows them to this codebase.
const CODE_KEYWORDS: &[&str] = &[
    "implement", "write", "add", "fix", "change", "update", "create", "rename", "delete",
];

/// Words that anchor a change request to code.
const SCOPE_KEYWORDS: &[&str] = &[
    "function", "file", "code", "test", "struct", "class", "method", "module", "endpoint",
];

/// Result of routing one inbound message. Computed fresh per message and
/// never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub agent: String,
    pub tools: Vec<String>,
    pub reason: String,
}

/// Pick an agent for `message`. Ties within a keyword set are irrelevant
/// (every keyword of a set routes to the same agent); across sets the order
/// above wins.
pub fn route_heuristic(
    message: &str,
    agents: &[AgentPack],
    default_agent: &str,
) -> RoutingDecision {
    let text = message.trim().to_lowercase();
    if text.is_empty() {
        return decision_for(agents, default_agent, "empty");
    }

    if contains_any(&text, DEBUG_KEYWORDS) {
        if let Some(decision) = decision_if_present(agents, "debugger", "debug_keywords") {
            return decision;
        }
    }
    if contains_any(&text, ARCHITECTURE_KEYWORDS) {
        if let Some(decision) = decision_if_present(agents, "architect", "architecture_keywords") {
            return decision;
        }
    }
    if contains_any(&text, CODE_KEYWORDS) && contains_any(&text, SCOPE_KEYWORDS) {
        if let Some(decision) = decision_if_present(agents, "coder", "code_keywords") {
            return decision;
        }
    }

    decision_for(agents, default_agent, "default")
}

/// Decision for an explicitly pinned agent, falling back to the default pack
/// when the pinned name no longer exists in the catalog.
pub fn pinned_decision(agents: &[AgentPack], name: &str) -> RoutingDecision {
    decision_for(agents, name, "pinned")
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

fn decision_if_present(agents: &[AgentPack], name: &str, reason: &str) -> Option<RoutingDecision> {
    agents.iter().find(|a| a.name == name).map(|pack| RoutingDecision {
        agent: pack.name.clone(),
        tools: pack.tools.clone(),
        reason: reason.to_string(),
    })
}

fn decision_for(agents: &[AgentPack], name: &str, reason: &str) -> RoutingDecision {
    match agents
        .iter()
        .find(|a| a.name == name)
        .or_else(|| agents.first())
    {
        Some(pack) => RoutingDecision {
            agent: pack.name.clone(),
            tools: pack.tools.clone(),
            reason: reason.to_string(),
        },
        None => RoutingDecision {
            agent: name.to_string(),
            tools: Vec::new(),
            reason: reason.to_string(),
        },
    }
}
