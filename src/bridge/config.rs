//! Layered configuration for the bridge.
//!
//! Settings are read from `bridge.toml` (all sections optional, sensible
//! defaults), then overridden by environment variables, then by CLI flags.
//!
//! ```toml
//! [server]
//! port = 3939
//!
//! [repo]
//! path = "."
//! trunk_branch = "main"
//! staging_branch = "bridge-staging"
//!
//! [agent]
//! base_url = "https://api.cursor.com"
//! model = "claude-4.5-sonnet"
//!
//! [store]
//! base_url = "http://localhost:3000"
//!
//! [poll]
//! agent_interval_secs = 10
//! agent_max_polls = 180
//! deploy_interval_secs = 5
//! deploy_max_polls = 120
//! max_retries = 3
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// HTTP/WebSocket server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    3939
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            dev_mode: false,
        }
    }
}

/// Local repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSection {
    /// Working copy the bridge stages branches in.
    #[serde(default = "default_repo_path")]
    pub path: PathBuf,
    /// Trunk branch deployments are merged into.
    #[serde(default = "default_trunk")]
    pub trunk_branch: String,
    /// Default staging branch when a submission names none.
    #[serde(default = "default_staging")]
    pub staging_branch: String,
    /// Directory (relative to the repo) for prompt artifacts and history.
    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: PathBuf,
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_trunk() -> String {
    "main".to_string()
}

fn default_staging() -> String {
    "bridge-staging".to_string()
}

fn default_prompts_dir() -> PathBuf {
    PathBuf::from(".taskbridge/prompts")
}

impl Default for RepoSection {
    fn default() -> Self {
        Self {
            path: default_repo_path(),
            trunk_branch: default_trunk(),
            staging_branch: default_staging(),
            prompts_dir: default_prompts_dir(),
        }
    }
}

/// Remote coding-agent service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_base_url")]
    pub base_url: String,
    /// Bearer token for the agent service. Usually supplied via the
    /// `BRIDGE_AGENT_API_KEY` environment variable rather than the file.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_agent_model")]
    pub model: String,
}

fn default_agent_base_url() -> String {
    "https://api.cursor.com".to_string()
}

fn default_agent_model() -> String {
    "claude-4.5-sonnet".to_string()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            base_url: default_agent_base_url(),
            api_key: None,
            model: default_agent_model(),
        }
    }
}

/// External task-record store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Explicit store base URL. When unset, candidate local ports are probed.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_probe_ports")]
    pub probe_ports: Vec<u16>,
}

fn default_probe_ports() -> Vec<u16> {
    vec![3000, 3001, 3002, 3003]
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            base_url: None,
            probe_ports: default_probe_ports(),
        }
    }
}

/// Dispatch fallbacks used when the agent service rejects a creation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackSection {
    /// Local command handed the prompt artifact path (e.g. an editor CLI).
    #[serde(default)]
    pub cli_cmd: Option<String>,
    /// HTTP endpoint of a local editor-extension relay.
    #[serde(default)]
    pub relay_url: Option<String>,
}

/// Polling cadence and retry bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSection {
    #[serde(default = "default_agent_interval")]
    pub agent_interval_secs: u64,
    #[serde(default = "default_agent_max_polls")]
    pub agent_max_polls: u32,
    #[serde(default = "default_deploy_interval")]
    pub deploy_interval_secs: u64,
    #[serde(default = "default_deploy_max_polls")]
    pub deploy_max_polls: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_agent_interval() -> u64 {
    10
}

fn default_agent_max_polls() -> u32 {
    180
}

fn default_deploy_interval() -> u64 {
    5
}

fn default_deploy_max_polls() -> u32 {
    120
}

fn default_max_retries() -> u32 {
    3
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            agent_interval_secs: default_agent_interval(),
            agent_max_polls: default_agent_max_polls(),
            deploy_interval_secs: default_deploy_interval(),
            deploy_max_polls: default_deploy_max_polls(),
            max_retries: default_max_retries(),
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub repo: RepoSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub fallback: FallbackSection,
    #[serde(default)]
    pub poll: PollSection,
}

impl BridgeConfig {
    /// Load from a `bridge.toml`, falling back to defaults when the file
    /// doesn't exist, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides through an injectable lookup, so tests
    /// never have to mutate process-global state.
    pub fn apply_env_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(key) = get("BRIDGE_AGENT_API_KEY") {
            self.agent.api_key = Some(key);
        }
        if let Some(url) = get("BRIDGE_AGENT_BASE_URL") {
            self.agent.base_url = url;
        }
        if let Some(url) = get("BRIDGE_STORE_URL") {
            self.store.base_url = Some(url);
        }
        if let Some(port) = get("BRIDGE_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    /// Absolute prompts directory for the configured repository.
    pub fn prompts_dir(&self) -> PathBuf {
        self.repo.path.join(&self.repo.prompts_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.server.port, 3939);
        assert_eq!(config.repo.trunk_branch, "main");
        assert_eq!(config.repo.staging_branch, "bridge-staging");
        assert_eq!(config.poll.agent_interval_secs, 10);
        assert_eq!(config.poll.agent_max_polls, 180);
        assert_eq!(config.poll.deploy_interval_secs, 5);
        assert_eq!(config.poll.deploy_max_polls, 120);
        assert_eq!(config.poll.max_retries, 3);
        assert_eq!(config.store.probe_ports, vec![3000, 3001, 3002, 3003]);
        assert!(config.agent.api_key.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [server]
            port = 4000

            [repo]
            trunk_branch = "master"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.repo.trunk_branch, "master");
        // Untouched sections keep their defaults
        assert_eq!(config.repo.staging_branch, "bridge-staging");
        assert_eq!(config.poll.max_retries, 3);
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3939);
        assert_eq!(config.agent.model, "claude-4.5-sonnet");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BridgeConfig::default();
        config.apply_env_overrides(|key| match key {
            "BRIDGE_AGENT_API_KEY" => Some("key_test".into()),
            "BRIDGE_STORE_URL" => Some("http://localhost:9999".into()),
            "BRIDGE_PORT" => Some("4242".into()),
            _ => None,
        });
        assert_eq!(config.agent.api_key.as_deref(), Some("key_test"));
        assert_eq!(
            config.store.base_url.as_deref(),
            Some("http://localhost:9999")
        );
        assert_eq!(config.server.port, 4242);
    }

    #[test]
    fn test_bad_port_env_is_ignored() {
        let mut config = BridgeConfig::default();
        config.apply_env_overrides(|key| match key {
            "BRIDGE_PORT" => Some("not-a-port".into()),
            _ => None,
        });
        assert_eq!(config.server.port, 3939);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load(&dir.path().join("bridge.toml")).unwrap();
        assert_eq!(config.server.port, 3939);
    }

    #[test]
    fn test_load_rejects_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(BridgeConfig::load(&path).is_err());
    }

    #[test]
    fn test_prompts_dir_joins_repo_path() {
        let mut config = BridgeConfig::default();
        config.repo.path = PathBuf::from("/work/app");
        assert_eq!(
            config.prompts_dir(),
            PathBuf::from("/work/app/.taskbridge/prompts")
        );
    }
}
