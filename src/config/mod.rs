use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const API_KEY_ENV: &str = "LITTLECLAW_API_KEY";
pub const TELEGRAM_TOKEN_ENV: &str = "LITTLECLAW_TELEGRAM_TOKEN";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub allowed_users: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenRouter,
    OpenAi,
    Ollama,
}

impl ProviderKind {
    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_provider_timeout() -> u64 {
    120
}

impl ProviderConfig {
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| self.kind.default_base_url().to_string())
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            base_url: None,
            api_key: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_path")]
    pub path: PathBuf,
}

fn default_workspace_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".littleclaw").join("workspace"))
        .unwrap_or_else(|| PathBuf::from("./workspace"))
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            path: default_workspace_path(),
        }
    }
}

pub const DEFAULT_PERSONA: &str = "You are Littleclaw, an ultra-fast, deeply personalized AI agent.\n\
You have access to local file execution and scripts. Be concise, direct, and brilliant.";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_history_bytes")]
    pub history_bytes: u64,
    #[serde(default = "default_persona")]
    pub persona: String,
}

fn default_max_iterations() -> usize {
    10
}

fn default_history_bytes() -> u64 {
    4000
}

fn default_persona() -> String {
    DEFAULT_PERSONA.to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            history_bytes: default_history_bytes(),
            persona: default_persona(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_rotate_bytes")]
    pub rotate_bytes: u64,
}

fn default_rotate_bytes() -> u64 {
    1024 * 1024
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            rotate_bytes: default_rotate_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    30 * 60
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_heartbeat_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,
    #[serde(default = "default_blocked_commands")]
    pub blocked_commands: Vec<String>,
}

fn default_exec_timeout() -> u64 {
    60
}

pub fn default_blocked_commands() -> Vec<String> {
    ["rm -rf", "rm -fr", "mkfs", "dd if="]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            exec_timeout_secs: default_exec_timeout(),
            blocked_commands: default_blocked_commands(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

fn default_bus_capacity() -> usize {
    100
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Config file not found: {}\nCopy config.example.yaml to config.yaml and edit it.",
                path.display()
            );
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env();
        config.workspace.path = expand_home(&config.workspace.path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).with_context(|| "Failed to parse config YAML")
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                self.provider.api_key = key;
            }
        }
        if let Ok(token) = std::env::var(TELEGRAM_TOKEN_ENV) {
            if !token.is_empty() {
                self.telegram.token = token;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.token.is_empty() || self.telegram.token == "YOUR_BOT_TOKEN_HERE" {
            anyhow::bail!(
                "Missing Telegram token: set telegram.token in the config or {}",
                TELEGRAM_TOKEN_ENV
            );
        }
        if self.provider.kind != ProviderKind::Ollama && self.provider.api_key.is_empty() {
            anyhow::bail!(
                "Missing API key for provider '{}': set provider.api_key or {}",
                self.provider.kind.as_str(),
                API_KEY_ENV
            );
        }
        if self.agent.max_iterations == 0 {
            anyhow::bail!("agent.max_iterations must be at least 1");
        }
        if self.bus.capacity == 0 {
            anyhow::bail!("bus.capacity must be at least 1");
        }
        if self.heartbeat.enabled && self.heartbeat.interval_secs == 0 {
            anyhow::bail!("heartbeat.interval_secs must be at least 1");
        }
        Ok(())
    }
}
