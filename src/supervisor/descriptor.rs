//! Static per-backend descriptors: where each backend listens, how it is
//! launched, and how patiently we wait for it.

use std::time::Duration;

use crate::config::{ServiceConfig, ServicesConfig};

/// Default ports bound by the stock backend scripts.
pub const DEFAULT_LLM_PORT: u16 = 12345;
pub const DEFAULT_VLM_PORT: u16 = 12346;
pub const DEFAULT_TTS_PORT: u16 = 8880;

const DEFAULT_READY_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_GRACE_PERIOD_MS: u64 = 5_000;

/// Backend kinds under supervision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Text LLM
    Llm,
    /// Vision-language model
    Vlm,
    /// Text-to-speech
    Tts,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [ServiceKind::Llm, ServiceKind::Vlm, ServiceKind::Tts];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Llm => "llm",
            ServiceKind::Vlm => "vlm",
            ServiceKind::Tts => "tts",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "llm" => Some(ServiceKind::Llm),
            "vlm" => Some(ServiceKind::Vlm),
            "tts" => Some(ServiceKind::Tts),
            _ => None,
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            ServiceKind::Llm => DEFAULT_LLM_PORT,
            ServiceKind::Vlm => DEFAULT_VLM_PORT,
            ServiceKind::Tts => DEFAULT_TTS_PORT,
        }
    }

    /// Convention wrapper used when no explicit command is configured.
    fn default_command(&self) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            format!("scripts/{}/run.sh", self.as_str()),
        ]
    }

    /// Model-listing path for backends that report one.
    fn models_path(&self) -> Option<&'static str> {
        match self {
            ServiceKind::Llm | ServiceKind::Vlm => Some("/v1/models"),
            ServiceKind::Tts => None,
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved launch and health parameters for one backend.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub kind: ServiceKind,
    pub host: String,
    pub port: u16,
    pub health_path: String,
    pub models_path: Option<&'static str>,
    pub command: Vec<String>,
    pub auto_start: bool,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub grace_period: Duration,
}

impl ServiceDescriptor {
    /// Merge built-in defaults for `kind` with explicit config overrides.
    pub fn resolve(kind: ServiceKind, config: &ServiceConfig) -> Self {
        Self {
            kind,
            host: config
                .host
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port: config.port.unwrap_or_else(|| kind.default_port()),
            health_path: config
                .health_path
                .clone()
                .unwrap_or_else(|| "/health".to_string()),
            models_path: kind.models_path(),
            command: config
                .command
                .clone()
                .unwrap_or_else(|| kind.default_command()),
            auto_start: config.auto_start.unwrap_or(false),
            ready_timeout: Duration::from_millis(
                config.ready_timeout_ms.unwrap_or(DEFAULT_READY_TIMEOUT_MS),
            ),
            poll_interval: Duration::from_millis(
                config.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            grace_period: Duration::from_millis(
                config.grace_period_ms.unwrap_or(DEFAULT_GRACE_PERIOD_MS),
            ),
        }
    }

    /// Resolve all three backends from config.
    pub fn resolve_all(services: &ServicesConfig) -> Vec<ServiceDescriptor> {
        vec![
            Self::resolve(ServiceKind::Llm, &services.llm),
            Self::resolve(ServiceKind::Vlm, &services.vlm),
            Self::resolve(ServiceKind::Tts, &services.tts),
        ]
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_path)
    }

    pub fn models_url(&self) -> Option<String> {
        self.models_path
            .map(|path| format!("{}{}", self.base_url(), path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServicesConfig;

    #[test]
    fn test_defaults_per_kind() {
        let services = ServicesConfig::default();
        let all = ServiceDescriptor::resolve_all(&services);
        assert_eq!(all.len(), 3);

        let llm = &all[0];
        assert_eq!(llm.kind, ServiceKind::Llm);
        assert_eq!(llm.port, DEFAULT_LLM_PORT);
        assert_eq!(llm.health_url(), "http://127.0.0.1:12345/health");
        assert_eq!(
            llm.models_url().as_deref(),
            Some("http://127.0.0.1:12345/v1/models")
        );
        assert_eq!(llm.command, vec!["/bin/sh", "scripts/llm/run.sh"]);
        assert!(!llm.auto_start);

        let tts = &all[2];
        assert_eq!(tts.port, DEFAULT_TTS_PORT);
        assert!(tts.models_url().is_none());
    }

    #[test]
    fn test_config_overrides_win() {
        let config = ServiceConfig {
            host: Some("0.0.0.0".to_string()),
            port: Some(9999),
            command: Some(vec!["python3".to_string(), "server.py".to_string()]),
            auto_start: Some(true),
            ready_timeout_ms: Some(1000),
            ..Default::default()
        };
        let desc = ServiceDescriptor::resolve(ServiceKind::Vlm, &config);
        assert_eq!(desc.base_url(), "http://0.0.0.0:9999");
        assert_eq!(desc.command[0], "python3");
        assert!(desc.auto_start);
        assert_eq!(desc.ready_timeout, Duration::from_millis(1000));
        assert_eq!(desc.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ServiceKind::from_name("llm"), Some(ServiceKind::Llm));
        assert_eq!(ServiceKind::from_name("vlm"), Some(ServiceKind::Vlm));
        assert_eq!(ServiceKind::from_name("tts"), Some(ServiceKind::Tts));
        assert_eq!(ServiceKind::from_name("gpu"), None);
        assert_eq!(ServiceKind::Llm.to_string(), "llm");
    }
}
