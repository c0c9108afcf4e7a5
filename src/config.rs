//! Agentloop configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default model served by the stock text-LLM backend script.
pub const DEFAULT_LLM_MODEL: &str = "mlx-community/Llama-3.2-3B-Instruct-4bit";

/// Main agentloop configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentloopConfig {
    /// Gateway server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Workspace (tool sandbox) configuration
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Text-LLM request configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Supervised backend services
    #[serde(default)]
    pub services: ServicesConfig,

    /// Agent pack catalog configuration
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Workbench comparison fan-out configuration
    #[serde(default)]
    pub workbench: WorkbenchConfig,
}

/// Gateway server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

/// Workspace configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory the file tools are sandboxed to (default: current dir)
    pub root: Option<PathBuf>,
}

impl WorkspaceConfig {
    /// Resolve the sandbox root to an absolute path.
    pub fn resolve_root(&self) -> PathBuf {
        let root = self
            .root
            .clone()
            .map(expand_tilde)
            .unwrap_or_else(|| PathBuf::from("."));
        root.canonicalize().unwrap_or(root)
    }
}

/// Text-LLM request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model id sent with chat-completion requests
    pub model: String,

    /// Token budget per completion
    pub max_tokens: u32,

    /// Sampling temperature used when the agent pack does not override it
    pub temperature: f32,

    /// Nucleus sampling cutoff
    pub top_p: f32,

    /// Request deadline; past it the request is aborted and treated as failed
    pub request_timeout_secs: u64,

    /// Primary answers shorter than this (chars, trimmed) trigger one
    /// follow-up continuation when the agent pack permits it
    pub follow_up_min_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_LLM_MODEL.to_string(),
            max_tokens: 1024,
            temperature: 0.7,
            top_p: 0.9,
            request_timeout_secs: 120,
            follow_up_min_chars: 80,
        }
    }
}

/// Supervised backend services
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Text-LLM backend overrides
    #[serde(default)]
    pub llm: ServiceConfig,

    /// Vision-language backend overrides
    #[serde(default)]
    pub vlm: ServiceConfig,

    /// Text-to-speech backend overrides
    #[serde(default)]
    pub tts: ServiceConfig,
}

/// Per-backend configuration overrides.
///
/// Every field is optional; unset fields fall back to the backend's
/// built-in descriptor defaults (see `supervisor::descriptor`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Host the backend binds
    pub host: Option<String>,

    /// Port the backend binds
    pub port: Option<u16>,

    /// Health-check path
    pub health_path: Option<String>,

    /// Launch argv; unset resolves to the convention wrapper script
    pub command: Option<Vec<String>>,

    /// Start this backend at process startup
    pub auto_start: Option<bool>,

    /// How long to poll the health endpoint before giving up (ms)
    pub ready_timeout_ms: Option<u64>,

    /// Health poll interval while starting (ms)
    pub poll_interval_ms: Option<u64>,

    /// Grace period between terminate and kill at shutdown (ms)
    pub grace_period_ms: Option<u64>,
}

/// Agent pack catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Directory of user-supplied agent pack TOML files (merged over built-ins)
    pub dir: Option<PathBuf>,

    /// How long loaded packs stay cached before re-reading the directory
    pub refresh_secs: u64,

    /// Agent used when routing finds no signal
    pub default_agent: String,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            refresh_secs: 30,
            default_agent: "general".to_string(),
        }
    }
}

/// Workbench comparison fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkbenchConfig {
    /// Master switch for the fan-out
    pub enabled: bool,

    /// Presets replayed after an eligible primary response
    pub presets: Vec<WorkbenchPreset>,
}

impl Default for WorkbenchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            presets: vec![
                WorkbenchPreset {
                    name: "precise".to_string(),
                    model: None,
                    temperature: 0.2,
                    top_p: None,
                    max_tokens: None,
                },
                WorkbenchPreset {
                    name: "creative".to_string(),
                    model: None,
                    temperature: 0.9,
                    top_p: None,
                    max_tokens: None,
                },
            ],
        }
    }
}

/// One workbench preset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkbenchPreset {
    /// Preset name used in perf.metric events
    pub name: String,

    /// Model override (default: the configured LLM model)
    pub model: Option<String>,

    /// Sampling temperature for this preset
    pub temperature: f32,

    /// Nucleus sampling override
    pub top_p: Option<f32>,

    /// Token budget override
    pub max_tokens: Option<u32>,
}

impl AgentloopConfig {
    /// Load configuration from `path`, falling back to the default location
    /// and then to built-in defaults when no file exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let config: Self = toml::from_str(&raw)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Config(format!("{}: {}", path.display(), e))),
        }
    }

    /// Resolved agent pack override directory, tilde-expanded.
    pub fn agents_dir(&self) -> Option<PathBuf> {
        self.agents.dir.clone().map(expand_tilde)
    }
}

/// Default config file location: `~/.config/agentloop/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|d| d.join("agentloop").join("config.toml"))
}

/// Expand a leading `~/` against the home directory.
fn expand_tilde(path: PathBuf) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(stripped);
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AgentloopConfig::default();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.llm.model, DEFAULT_LLM_MODEL);
        assert_eq!(config.agents.default_agent, "general");
        assert!(config.workbench.enabled);
        assert_eq!(config.workbench.presets.len(), 2);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let raw = r#"
            [server]
            host = "0.0.0.0"
            port = 9000

            [services.llm]
            auto_start = true
            port = 15000
        "#;
        let config: AgentloopConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.services.llm.auto_start, Some(true));
        assert_eq!(config.services.llm.port, Some(15000));
        // Untouched sections keep defaults
        assert_eq!(config.llm.max_tokens, 1024);
        assert!(config.services.vlm.port.is_none());
    }

    #[test]
    fn test_load_missing_file_falls_back() {
        let config =
            AgentloopConfig::load(Some(Path::new("/nonexistent/agentloop.toml"))).unwrap();
        assert_eq!(config.server.port, 8787);
    }

    #[test]
    fn test_load_invalid_toml_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server").unwrap();
        let err = AgentloopConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_workbench_preset_roundtrip() {
        let raw = r#"
            [workbench]
            enabled = false

            [[workbench.presets]]
            name = "fast"
            temperature = 0.1
            max_tokens = 128
        "#;
        let config: AgentloopConfig = toml::from_str(raw).unwrap();
        assert!(!config.workbench.enabled);
        assert_eq!(config.workbench.presets.len(), 1);
        assert_eq!(config.workbench.presets[0].name, "fast");
        assert_eq!(config.workbench.presets[0].max_tokens, Some(128));
    }
}
