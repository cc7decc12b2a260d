use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::platform::{NativePlatform, Platform};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_memory_top_k")]
    pub memory_top_k: usize,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_delivery_retries")]
    pub delivery_retries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Zero disables the heartbeat.
    #[serde(default = "default_heartbeat_minutes")]
    pub heartbeat_minutes: u64,
    #[serde(default = "default_heartbeat_conversation")]
    pub heartbeat_conversation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    Hash,
    OpenAi,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_embedder")]
    pub embedder: EmbedderKind,
    /// Only used by the hash embedder; OpenAI embeddings are 1536 wide.
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginsConfig {
    #[serde(default = "default_enabled_plugins")]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub blocked_tools: Vec<String>,
    #[serde(default)]
    pub consolidate: bool,
}

fn default_data_dir() -> PathBuf {
    NativePlatform::data_dir()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_system_prompt() -> String {
    "You are Squidbot, a helpful personal assistant. You can remember facts with the \
     memory tools and schedule reminders or recurring tasks with the cron tools. \
     Be concise."
        .to_string()
}
fn default_max_iterations() -> usize {
    10
}
fn default_history_turns() -> usize {
    40
}
fn default_memory_top_k() -> usize {
    5
}
fn default_tool_timeout() -> u64 {
    60
}
fn default_delivery_retries() -> usize {
    3
}
fn default_check_interval() -> u64 {
    30
}
fn default_heartbeat_minutes() -> u64 {
    30
}
fn default_heartbeat_conversation() -> String {
    "tcp:heartbeat".to_string()
}
fn default_embedder() -> EmbedderKind {
    EmbedderKind::Hash
}
fn default_embedding_dim() -> usize {
    256
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7777
}
fn default_enabled_plugins() -> Vec<String> {
    ["memory", "scheduler", "safety", "audit", "heartbeat", "consolidation"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_iterations: default_max_iterations(),
            history_turns: default_history_turns(),
            memory_top_k: default_memory_top_k(),
            tool_timeout_secs: default_tool_timeout(),
            delivery_retries: default_delivery_retries(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            heartbeat_minutes: default_heartbeat_minutes(),
            heartbeat_conversation: default_heartbeat_conversation(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            embedder: default_embedder(),
            embedding_dim: default_embedding_dim(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_plugins(),
            blocked_tools: Vec::new(),
            consolidate: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            llm: LlmConfig::default(),
            agent: AgentConfig::default(),
            scheduler: SchedulerConfig::default(),
            memory: MemoryConfig::default(),
            server: ServerConfig::default(),
            plugins: PluginsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load `config.toml` from `data_dir` (or the platform default), then
    /// apply environment overrides.
    pub async fn load(data_dir: Option<&Path>) -> Result<Self> {
        let dir = data_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(NativePlatform::data_dir);
        let config_path = dir.join(CONFIG_FILE);

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("reading {}", config_path.display()))?;
            let parsed: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", config_path.display()))?;
            info!("Loaded config from {}", config_path.display());
            parsed
        } else {
            info!("No {} found in {}, using defaults.", CONFIG_FILE, dir.display());
            AppConfig::default()
        };
        config.data_dir = dir;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.llm.api_key = key;
        }
        if let Some(model) = lookup("OPENAI_MODEL").filter(|m| !m.trim().is_empty()) {
            self.llm.model = model;
        }
        if let Some(url) = lookup("OPENAI_BASE_URL").filter(|u| !u.trim().is_empty()) {
            self.llm.base_url = url;
        }
        if let Some(raw) = lookup("HEARTBEAT_INTERVAL_MINUTES") {
            match raw.trim().parse::<u64>() {
                Ok(minutes) => self.scheduler.heartbeat_minutes = minutes,
                Err(_) => warn!("Ignoring invalid HEARTBEAT_INTERVAL_MINUTES={}", raw),
            }
        }
        if let Some(raw) = lookup("SQUID_PORT") {
            match raw.trim().parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!("Ignoring invalid SQUID_PORT={}", raw),
            }
        }
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.data_dir.join("plugins")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.data_dir.join("skills")
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.tool_timeout_secs.max(1))
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_secs.max(1))
    }

    /// Skill files are plain text appended to the system prompt.
    pub async fn load_skills(&self) -> Vec<String> {
        let dir = self.skills_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut paths = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut skills = Vec::new();
        for path in paths {
            match tokio::fs::read_to_string(&path).await {
                Ok(text) if !text.trim().is_empty() => skills.push(text),
                Ok(_) => {}
                Err(e) => warn!("Failed to read skill {}: {}", path.display(), e),
            }
        }
        info!("Loaded {} skill file(s) from {}", skills.len(), dir.display());
        skills
    }
}
