//! Bridge configuration.
//!
//! Options live under the `telegramBridge` key of `{PAI_DIR}/settings.json`.
//! Missing keys take defaults; unknown keys are ignored. A missing or
//! unparseable settings file is fatal at startup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub allowed_users: Vec<String>,
    pub sessions: SessionsConfig,
    pub security: SecurityConfig,
    pub response: ResponseConfig,
    pub server: ServerConfig,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub timeout_minutes: i64,
    pub max_concurrent: usize,
    pub default_work_dir: String,
    pub default_model: String,
    /// Hour of day (0-23) for the daily session reset. -1 disables.
    pub reset_hour: i32,
    /// IANA timezone name the reset hour is evaluated in.
    pub timezone: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 240,
            max_concurrent: 2,
            default_work_dir: "~/projects".to_string(),
            default_model: "claude-sonnet-4-5-20250929".to_string(),
            reset_hour: 4,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub rate_limit_per_minute: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseFormat {
    #[default]
    Concise,
    VoiceOnly,
    Full,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    pub format: ResponseFormat,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 7777 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub base_path: String,
    pub max_summaries: usize,
    pub retention_days: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_path: "/mnt/pai-data/memory".to_string(),
            max_summaries: 5,
            retention_days: 14,
        }
    }
}

/// PAI root directory: `$PAI_DIR`, falling back to `~/.claude`.
pub fn pai_dir() -> PathBuf {
    match std::env::var("PAI_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => home_dir().join(".claude"),
    }
}

/// Directory holding the bridge's own persistent state.
pub fn state_dir() -> PathBuf {
    pai_dir().join("skills/TelegramBridge/state")
}

pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// Expand a leading `~/` to the invoking user's home directory.
pub fn resolve_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

impl Config {
    /// Load configuration from `{PAI_DIR}/settings.json`.
    pub fn load() -> Result<Self> {
        let path = pai_dir().join("settings.json");
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("settings.json not found at {}", path.display()))?;
        let root: serde_json::Value = serde_json::from_str(&data)
            .with_context(|| format!("invalid settings.json at {}", path.display()))?;

        let mut config: Config = match root.get("telegramBridge") {
            Some(section) => serde_json::from_value(section.clone())
                .context("invalid telegramBridge section in settings.json")?,
            None => Config::default(),
        };

        config.sessions.default_work_dir = resolve_home(&config.sessions.default_work_dir)
            .to_string_lossy()
            .into_owned();
        config.memory.base_path = resolve_home(&config.memory.base_path)
            .to_string_lossy()
            .into_owned();

        Ok(config)
    }
}
