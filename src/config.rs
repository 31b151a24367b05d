use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub telegram: TelegramConfig,
    pub engine: EngineConfig,
    pub forwarding_rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8092,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub api_base: String,
    pub poll_interval_seconds: u64,
    pub poll_timeout_seconds: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: None,
            api_base: "https://api.telegram.org".to_string(),
            poll_interval_seconds: 1,
            poll_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub media_group_timeout_ms: u64,
    pub max_group_size: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub dedup_window_seconds: u64,
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            media_group_timeout_ms: 1500,
            max_group_size: 10,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
            dedup_window_seconds: 0,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    pub name: String,
    pub enabled: bool,
    pub source_chats: Vec<serde_json::Value>,
    pub target_chats: Vec<serde_json::Value>,
    pub filters: FilterConfig,
    pub ignore: IgnoreConfig,
    pub forwarding: ForwardingConfig,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            enabled: true,
            source_chats: Vec::new(),
            target_chats: Vec::new(),
            filters: FilterConfig::default(),
            ignore: IgnoreConfig::default(),
            forwarding: ForwardingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub mode: String,
    pub keywords: Vec<String>,
    pub regex_patterns: Vec<String>,
    pub media_types: Vec<String>,
    pub max_file_size: u64,
    pub min_file_size: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            mode: "whitelist".to_string(),
            keywords: Vec::new(),
            regex_patterns: Vec::new(),
            media_types: Vec::new(),
            max_file_size: 0,
            min_file_size: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    pub user_ids: Vec<i64>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    pub preserve_format: bool,
    pub add_source_info: bool,
    pub delay: f64,
    pub force_forward: bool,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            preserve_format: true,
            add_source_info: true,
            delay: 0.5,
            force_forward: false,
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("CHAT_RELAY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.chat-relay/chat-relay.json"))
}

pub fn load_config() -> anyhow::Result<Config> {
    load_config_from(&resolve_config_path())
}

pub fn load_config_from(path: &Path) -> anyhow::Result<Config> {
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str::<Config>(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(token) = env::var("CHAT_RELAY_TOKEN") {
        if !token.trim().is_empty() {
            cfg.auth.token = Some(token);
        }
    }

    if let Ok(token) = env::var("CHAT_RELAY_TELEGRAM_TOKEN") {
        if !token.trim().is_empty() {
            cfg.telegram.bot_token = Some(token);
            cfg.telegram.enabled = true;
        }
    }

    if let Ok(host) = env::var("CHAT_RELAY_HOST") {
        if !host.trim().is_empty() {
            cfg.server.host = host;
        }
    }

    if let Ok(port) = env::var("CHAT_RELAY_PORT") {
        if let Ok(port) = port.trim().parse::<u16>() {
            cfg.server.port = port;
        }
    }
}
