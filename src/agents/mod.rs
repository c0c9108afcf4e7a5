//! Agent packs: named bundles of system prompt, allow-listed tools, and
//! sampling/iteration limits.
//!
//! A small built-in set ships with the binary. User-supplied TOML files in
//! the configured agents directory are merged over the built-ins by name,
//! built-ins losing field-by-field where the override file sets a value.
//! The merged catalog is cached and re-read after a short TTL.

pub mod router;

pub use router::{pinned_decision, route_heuristic, RoutingDecision};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::AgentloopConfig;
use crate::protocol::AgentSummary;

/// The conversational no-tools agent every install has.
pub const DEFAULT_AGENT_NAME: &str = "general";

/// One agent profile. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPack {
    pub name: String,
    pub description: String,
    /// System-prompt fragment seeded into every completion for this agent
    pub system_prompt: String,
    /// Tool names this agent may call; empty means the quick no-tool path
    pub tools: Vec<String>,
    /// Iteration budget for the tool loop
    pub max_tool_calls: u32,
    /// How many prior transcript turns are replayed into the prompt
    pub max_history_turns: usize,
    /// Sampling override; `None` falls back to the configured LLM default
    pub temperature: Option<f32>,
    /// Whether a short primary answer may trigger one follow-up continuation
    pub allow_follow_up: bool,
}

impl AgentPack {
    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            tools: self.tools.clone(),
            max_tool_calls: self.max_tool_calls,
        }
    }

    pub fn uses_tools(&self) -> bool {
        !self.tools.is_empty() && self.max_tool_calls > 0
    }

    fn apply(&mut self, over: AgentPackOverride) {
        if let Some(description) = over.description {
            self.description = description;
        }
        if let Some(system_prompt) = over.system_prompt {
            self.system_prompt = system_prompt;
        }
        if let Some(tools) = over.tools {
            self.tools = tools;
        }
        if let Some(max_tool_calls) = over.max_tool_calls {
            self.max_tool_calls = max_tool_calls;
        }
        if let Some(max_history_turns) = over.max_history_turns {
            self.max_history_turns = max_history_turns;
        }
        if over.temperature.is_some() {
            self.temperature = over.temperature;
        }
        if let Some(allow_follow_up) = over.allow_follow_up {
            self.allow_follow_up = allow_follow_up;
        }
    }

    fn from_override(over: AgentPackOverride) -> Self {
        let mut pack = Self {
            name: over.name.clone(),
            description: String::new(),
            system_prompt: "You are a helpful assistant.".to_string(),
            tools: Vec::new(),
            max_tool_calls: 0,
            max_history_turns: 12,
            temperature: None,
            allow_follow_up: false,
        };
        pack.apply(over);
        pack
    }
}

/// On-disk shape of one user agent pack file. Everything but the name is
/// optional so a file can override a single field of a built-in.
#[derive(Debug, Clone, Deserialize)]
struct AgentPackOverride {
    name: String,
    description: Option<String>,
    system_prompt: Option<String>,
    tools: Option<Vec<String>>,
    max_tool_calls: Option<u32>,
    max_history_turns: Option<usize>,
    temperature: Option<f32>,
    allow_follow_up: Option<bool>,
}

fn general_pack() -> AgentPack {
    AgentPack {
        name: DEFAULT_AGENT_NAME.to_string(),
        description: "Conversational assistant for everyday questions".to_string(),
        system_prompt: "You are a helpful assistant running fully on this machine. \
                        Answer conversationally and keep responses grounded and concise."
            .to_string(),
        tools: Vec::new(),
        max_tool_calls: 0,
        max_history_turns: 12,
        temperature: None,
        allow_follow_up: true,
    }
}

/// Built-in agent packs shipped with agentloop
fn built_in_packs() -> Vec<AgentPack> {
    vec![
        general_pack(),
        AgentPack {
            name: "coder".to_string(),
            description: "Makes and explains code changes in the workspace".to_string(),
            system_prompt: "You are a coding assistant working inside the user's repository. \
                            Read the relevant files with the available tools before answering, \
                            and keep proposed changes minimal and concrete."
                .to_string(),
            tools: vec![
                "fs.read".to_string(),
                "fs.list".to_string(),
                "time.now".to_string(),
            ],
            max_tool_calls: 4,
            max_history_turns: 8,
            temperature: Some(0.4),
            allow_follow_up: false,
        },
        AgentPack {
            name: "debugger".to_string(),
            description: "Diagnoses errors, stack traces, and failing services".to_string(),
            system_prompt: "You are a debugging assistant. Work from evidence: read the failing \
                            code, check backend status when services are involved, and explain \
                            the most likely root cause before suggesting a fix."
                .to_string(),
            tools: vec![
                "fs.read".to_string(),
                "fs.list".to_string(),
                "service.status".to_string(),
                "time.now".to_string(),
            ],
            max_tool_calls: 6,
            max_history_turns: 8,
            temperature: Some(0.2),
            allow_follow_up: false,
        },
        AgentPack {
            name: "architect".to_string(),
            description: "Reasons about structure, boundaries, and trade-offs".to_string(),
            system_prompt: "You are a software architecture assistant. Inspect the repository \
                            layout with the available tools before proposing designs, and name \
                            the trade-offs of each option you suggest."
                .to_string(),
            tools: vec![
                "fs.list".to_string(),
                "fs.read".to_string(),
                "web.logo".to_string(),
            ],
            max_tool_calls: 3,
            max_history_turns: 10,
            temperature: Some(0.6),
            allow_follow_up: false,
        },
    ]
}

struct Cache {
    packs: Vec<AgentPack>,
    loaded_at: Option<Instant>,
}

/// TTL-refreshed catalog of agent packs, shared by reference with the engine.
pub struct AgentCatalog {
    dir: Option<PathBuf>,
    ttl: Duration,
    default_agent: String,
    cache: RwLock<Cache>,
}

impl AgentCatalog {
    pub fn new(dir: Option<PathBuf>, ttl: Duration, default_agent: String) -> Self {
        Self {
            dir,
            ttl,
            default_agent,
            cache: RwLock::new(Cache {
                packs: Vec::new(),
                loaded_at: None,
            }),
        }
    }

    pub fn from_config(config: &AgentloopConfig) -> Self {
        Self::new(
            config.agents_dir(),
            Duration::from_secs(config.agents.refresh_secs),
            config.agents.default_agent.clone(),
        )
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    /// The merged catalog, re-reading the override directory when the cached
    /// copy is older than the TTL.
    pub async fn packs(&self) -> Vec<AgentPack> {
        {
            let cache = self.cache.read().await;
            if let Some(at) = cache.loaded_at {
                if at.elapsed() < self.ttl {
                    return cache.packs.clone();
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if let Some(at) = cache.loaded_at {
            if at.elapsed() < self.ttl {
                return cache.packs.clone();
            }
        }
        let packs = load_packs(self.dir.as_deref());
        cache.packs = packs.clone();
        cache.loaded_at = Some(Instant::now());
        packs
    }

    pub async fn get(&self, name: &str) -> Option<AgentPack> {
        self.packs().await.into_iter().find(|p| p.name == name)
    }

    /// The pack used when routing finds no signal or a pinned agent is gone.
    pub async fn default_pack(&self) -> AgentPack {
        let packs = self.packs().await;
        packs
            .iter()
            .find(|p| p.name == self.default_agent)
            .or_else(|| packs.iter().find(|p| p.name == DEFAULT_AGENT_NAME))
            .cloned()
            .unwrap_or_else(general_pack)
    }

    pub async fn summaries(&self) -> Vec<AgentSummary> {
        self.packs().await.iter().map(AgentPack::summary).collect()
    }
}

fn load_packs(dir: Option<&Path>) -> Vec<AgentPack> {
    let mut packs = built_in_packs();
    let Some(dir) = dir else {
        return packs;
    };
    for over in load_overrides(dir) {
        match packs.iter_mut().find(|p| p.name == over.name) {
            Some(existing) => existing.apply(over),
            None => packs.push(AgentPack::from_override(over)),
        }
    }
    packs
}

/// Read every `*.toml` in the override directory. Unreadable or malformed
/// files are skipped with a warning.
fn load_overrides(dir: &Path) -> Vec<AgentPackOverride> {
    let mut overrides = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return overrides,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str::<AgentPackOverride>(&raw) {
                Ok(over) => overrides.push(over),
                Err(e) => {
                    tracing::warn!("failed to parse agent pack {}: {}", path.display(), e)
                }
            },
            Err(e) => tracing::warn!("failed to read agent pack {}: {}", path.display(), e),
        }
    }

    // Stable merge order regardless of directory iteration order.
    overrides.sort_by(|a, b| a.name.cmp(&b.name));
    overrides
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn catalog_with_dir(dir: Option<PathBuf>, ttl: Duration) -> AgentCatalog {
        AgentCatalog::new(dir, ttl, DEFAULT_AGENT_NAME.to_string())
    }

    #[tokio::test]
    async fn test_builtins_present() {
        let catalog = catalog_with_dir(None, Duration::from_secs(60));
        let packs = catalog.packs().await;
        for name in ["general", "coder", "debugger", "architect"] {
            assert!(packs.iter().any(|p| p.name == name), "missing {name}");
        }

        let general = catalog.get("general").await.unwrap();
        assert!(general.tools.is_empty());
        assert!(!general.uses_tools());
        assert!(general.allow_follow_up);

        let debugger = catalog.get("debugger").await.unwrap();
        assert!(debugger.uses_tools());
        assert!(debugger.tools.contains(&"service.status".to_string()));
    }

    #[tokio::test]
    async fn test_default_pack_is_general() {
        let catalog = catalog_with_dir(None, Duration::from_secs(60));
        assert_eq!(catalog.default_pack().await.name, "general");
    }

    #[tokio::test]
    async fn test_override_merges_field_by_field() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("coder.toml"),
            "name = \"coder\"\ntemperature = 0.1\ndescription = \"tuned\"\n",
        )
        .unwrap();

        let catalog = catalog_with_dir(Some(dir.path().to_path_buf()), Duration::ZERO);
        let coder = catalog.get("coder").await.unwrap();
        assert_eq!(coder.temperature, Some(0.1));
        assert_eq!(coder.description, "tuned");
        // Fields the file does not set keep their built-in values
        assert!(coder.tools.contains(&"fs.read".to_string()));
        assert_eq!(coder.max_tool_calls, 4);
    }

    #[tokio::test]
    async fn test_override_file_adds_new_pack() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("reviewer.toml"),
            "name = \"reviewer\"\nsystem_prompt = \"You review diffs.\"\ntools = [\"fs.read\"]\nmax_tool_calls = 2\n",
        )
        .unwrap();

        let catalog = catalog_with_dir(Some(dir.path().to_path_buf()), Duration::ZERO);
        let reviewer = catalog.get("reviewer").await.unwrap();
        assert_eq!(reviewer.system_prompt, "You review diffs.");
        assert!(reviewer.uses_tools());

        let summaries = catalog.summaries().await;
        assert!(summaries.iter().any(|s| s.name == "reviewer"));
    }

    #[tokio::test]
    async fn test_malformed_override_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "name = [not toml").unwrap();

        let catalog = catalog_with_dir(Some(dir.path().to_path_buf()), Duration::ZERO);
        let packs = catalog.packs().await;
        assert_eq!(packs.len(), built_in_packs().len());
    }

    #[tokio::test]
    async fn test_catalog_caches_until_ttl() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog_with_dir(Some(dir.path().to_path_buf()), Duration::from_secs(60));

        let before = catalog.packs().await.len();
        std::fs::write(dir.path().join("late.toml"), "name = \"late\"\n").unwrap();

        // Within the TTL the cached copy is served.
        assert_eq!(catalog.packs().await.len(), before);

        // A zero-TTL catalog sees the file immediately.
        let fresh = catalog_with_dir(Some(dir.path().to_path_buf()), Duration::ZERO);
        assert_eq!(fresh.packs().await.len(), before + 1);
    }
}
